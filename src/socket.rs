//! Raw socket factory
//!
//! Adapters never open sockets themselves. They ask a [`RawSocketFactory`],
//! which picks between two transports:
//!
//! - **Tunnel**: the host process registered a [`TunnelProvider`] (for
//!   example a packet-tunnel extension with no direct internet access).
//!   Streams are created through it.
//! - **Kernel**: a plain nonblocking TCP socket, configured with `socket2`.
//!
//! The choice is made again on every call because the host can register
//! or clear its provider at any time. The factory only ever holds a weak
//! handle; the provider's lifetime belongs to the host.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::AdapterError;

/// Duplex byte stream usable as either end of a relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed duplex stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport a socket is created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// Direct kernel socket
    Kernel,
    /// Socket created through the registered tunnel provider
    Tunnel,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Capability exposed by the host's tunnel to open TCP streams through it
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a TCP stream to `addr` through the tunnel
    async fn create_tcp_connection(&self, addr: SocketAddr) -> io::Result<BoxedStream>;
}

/// Registration slot for the host's tunnel provider
///
/// Holds a weak handle only. A provider that has been dropped by its owner
/// reads as absent, exactly as if it had been cleared.
#[derive(Default)]
pub struct TunnelProviderSlot {
    provider: RwLock<Option<Weak<dyn TunnelProvider>>>,
}

static GLOBAL_SLOT: OnceLock<Arc<TunnelProviderSlot>> = OnceLock::new();

impl TunnelProviderSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_SLOT.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register the active provider, replacing any previous one
    pub fn register(&self, provider: &Arc<dyn TunnelProvider>) {
        *self.provider.write() = Some(Arc::downgrade(provider));
        debug!("tunnel provider registered");
    }

    /// Clear the registration
    pub fn clear(&self) {
        if self.provider.write().take().is_some() {
            debug!("tunnel provider cleared");
        }
    }

    /// The provider, if one is registered and still alive
    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn TunnelProvider>> {
        self.provider.read().as_ref().and_then(Weak::upgrade)
    }

    /// Whether a live provider is registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }
}

impl fmt::Debug for TunnelProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelProviderSlot")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Creates outbound sockets on the right transport
#[derive(Debug)]
pub struct RawSocketFactory {
    slot: Arc<TunnelProviderSlot>,
    require_tunnel: bool,
    keepalive: Option<Duration>,
}

impl RawSocketFactory {
    /// Factory reading the process-wide slot
    #[must_use]
    pub fn new() -> Self {
        Self::with_slot(TunnelProviderSlot::global())
    }

    /// Factory reading a specific slot
    #[must_use]
    pub fn with_slot(slot: Arc<TunnelProviderSlot>) -> Self {
        Self {
            slot,
            require_tunnel: false,
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    /// Refuse kernel sockets entirely (sandboxed extension)
    #[must_use]
    pub const fn require_tunnel(mut self, required: bool) -> Self {
        self.require_tunnel = required;
        self
    }

    /// TCP keepalive idle time for kernel sockets; `None` disables it
    #[must_use]
    pub const fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    /// The slot this factory reads
    #[must_use]
    pub fn slot(&self) -> &Arc<TunnelProviderSlot> {
        &self.slot
    }

    fn select(
        &self,
        preferred: Option<SocketKind>,
        tunnel_active: bool,
    ) -> Result<SocketKind, AdapterError> {
        match preferred {
            Some(SocketKind::Kernel) if !self.require_tunnel => Ok(SocketKind::Kernel),
            _ if tunnel_active => Ok(SocketKind::Tunnel),
            _ if self.require_tunnel => Err(AdapterError::TunnelUnavailable),
            _ => Ok(SocketKind::Kernel),
        }
    }

    /// Decide which transport a new socket would use right now.
    ///
    /// A live tunnel provider wins unless the caller explicitly prefers a
    /// kernel socket. Not cached: the slot is read on every call.
    ///
    /// # Errors
    ///
    /// [`AdapterError::TunnelUnavailable`] when tunnel sockets are required
    /// and no provider is registered.
    pub fn get_socket(&self, preferred: Option<SocketKind>) -> Result<SocketKind, AdapterError> {
        self.select(preferred, self.slot.is_active())
    }

    /// Open a TCP stream to `addr` on the selected transport.
    ///
    /// # Errors
    ///
    /// Connection failures, timeouts and socket option failures are
    /// returned as [`AdapterError`].
    pub async fn connect(
        &self,
        addr: SocketAddr,
        preferred: Option<SocketKind>,
        connect_timeout: Duration,
    ) -> Result<(BoxedStream, SocketKind), AdapterError> {
        // Read the slot once so the decision and the provider agree
        let provider = self.slot.current();
        let kind = self.select(preferred, provider.is_some())?;
        trace!("connecting to {} via {} socket", addr, kind);

        let stream = match (kind, provider) {
            (SocketKind::Tunnel, Some(provider)) => {
                let result = timeout(connect_timeout, provider.create_tcp_connection(addr)).await;
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(AdapterError::connection_failed(addr.to_string(), e.to_string())),
                    Err(_) => {
                        return Err(AdapterError::Timeout {
                            target: addr.to_string(),
                            timeout_secs: connect_timeout.as_secs(),
                        })
                    }
                }
            }
            _ => Box::new(self.connect_kernel(addr, connect_timeout).await?),
        };

        Ok((stream, kind))
    }

    fn create_socket(&self, addr: SocketAddr) -> Result<Socket, AdapterError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| AdapterError::connection_failed(addr.to_string(), e.to_string()))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| AdapterError::socket_option("O_NONBLOCK", e.to_string()))?;

        if let Some(idle) = self.keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(idle)
                .with_interval(Duration::from_secs(15));
            socket
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| AdapterError::socket_option("TCP_KEEPALIVE", e.to_string()))?;
        }

        Ok(socket)
    }

    async fn connect_kernel(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, AdapterError> {
        let socket = self.create_socket(addr)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(AdapterError::connection_failed(addr.to_string(), e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| AdapterError::connection_failed(addr.to_string(), e.to_string()))?;

        let completed = timeout(connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| AdapterError::connection_failed(addr.to_string(), e.to_string()))?;
            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => {
                    Err(AdapterError::connection_failed(addr.to_string(), e.to_string()))
                }
            }
        })
        .await;

        match completed {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AdapterError::Timeout {
                target: addr.to_string(),
                timeout_secs: connect_timeout.as_secs(),
            }),
        }
    }
}

impl Default for RawSocketFactory {
    fn default() -> Self {
        Self::new()
    }
}
