//! Direct adapter
//!
//! Connects straight to the session's destination through the raw socket
//! factory. The destination is the session's resolved address, so fake
//! IPs never leak out: a session recovered from a fake IP connects to the
//! real address its DNS session recorded (or resolves the domain again).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{AdapterConnection, AdapterFactory, AdapterKind};
use crate::error::AdapterError;
use crate::session::{ConnectSession, HostResolver};
use crate::socket::{RawSocketFactory, SocketKind};

/// Default connect timeout for adapters
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Direct adapter factory
#[derive(Debug)]
pub struct DirectAdapterFactory {
    id: String,
    sockets: Arc<RawSocketFactory>,
    preferred: Option<SocketKind>,
    connect_timeout: Duration,
}

impl DirectAdapterFactory {
    /// Create a direct adapter using `sockets`
    pub fn new(id: impl Into<String>, sockets: Arc<RawSocketFactory>) -> Self {
        Self {
            id: id.into(),
            sockets,
            preferred: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Prefer a specific socket transport
    #[must_use]
    pub const fn with_socket(mut self, kind: Option<SocketKind>) -> Self {
        self.preferred = kind;
        self
    }

    /// Override the connect timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Preferred socket transport, if any
    #[must_use]
    pub const fn preferred_socket(&self) -> Option<SocketKind> {
        self.preferred
    }
}

#[async_trait]
impl AdapterFactory for DirectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Direct
    }

    fn resolves_locally(&self) -> bool {
        true
    }

    async fn connect(
        &self,
        session: &ConnectSession,
        resolver: &dyn HostResolver,
    ) -> Result<AdapterConnection, AdapterError> {
        let ip = session
            .ip_address(resolver)
            .await
            .ok_or_else(|| AdapterError::Unresolved {
                host: session.host().to_string(),
            })?;
        let addr = SocketAddr::new(ip, session.port());

        debug!("{} connecting session {} to {}", self.id, session.id(), addr);
        let (stream, kind) = self
            .sockets
            .connect(addr, self.preferred, self.connect_timeout)
            .await?;

        Ok(AdapterConnection::new(stream, addr.to_string(), kind))
    }
}
