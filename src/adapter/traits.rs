//! Adapter trait definitions
//!
//! An adapter factory turns a matched [`ConnectSession`] into a connected
//! duplex stream. Rules hold factories; the proxy calls `connect` once the
//! rule engine picked one.

use std::fmt;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::session::{ConnectSession, HostResolver};
use crate::socket::{BoxedStream, SocketKind};

/// Adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// Straight to the destination
    Direct,
    /// Refuse the connection
    Reject,
    /// Through an upstream HTTP proxy
    Http,
    /// Through an upstream SOCKS5 proxy
    Socks5,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Reject => write!(f, "reject"),
            Self::Http => write!(f, "http"),
            Self::Socks5 => write!(f, "socks5"),
        }
    }
}

/// An established adapter connection
pub struct AdapterConnection {
    stream: BoxedStream,
    remote: String,
    socket: SocketKind,
}

impl AdapterConnection {
    /// Wrap a connected stream
    pub fn new(stream: BoxedStream, remote: impl Into<String>, socket: SocketKind) -> Self {
        Self {
            stream,
            remote: remote.into(),
            socket,
        }
    }

    /// Consume and return the stream
    #[must_use]
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// Address actually connected to (the destination or the upstream proxy)
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Transport the underlying socket was created on
    #[must_use]
    pub const fn socket_kind(&self) -> SocketKind {
        self.socket
    }
}

impl fmt::Debug for AdapterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterConnection")
            .field("remote", &self.remote)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

/// Creates outbound connections for matched sessions
#[async_trait]
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    /// Identifier rules refer to this adapter by
    fn id(&self) -> &str;

    /// Adapter family
    fn kind(&self) -> AdapterKind;

    /// Whether this adapter needs the real address of the destination.
    ///
    /// DNS queries routed to such an adapter are answered with real
    /// addresses instead of fake ones.
    fn resolves_locally(&self) -> bool {
        false
    }

    /// Connect `session` to its destination.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError` when the connection cannot be established.
    async fn connect(
        &self,
        session: &ConnectSession,
        resolver: &dyn HostResolver,
    ) -> Result<AdapterConnection, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_kind_display() {
        assert_eq!(AdapterKind::Direct.to_string(), "direct");
        assert_eq!(AdapterKind::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_connection_accessors() {
        let (a, _b) = duplex(8);
        let conn = AdapterConnection::new(Box::new(a), "1.2.3.4:80", SocketKind::Tunnel);
        assert_eq!(conn.remote(), "1.2.3.4:80");
        assert_eq!(conn.socket_kind(), SocketKind::Tunnel);
        assert!(format!("{conn:?}").contains("1.2.3.4:80"));
    }
}
