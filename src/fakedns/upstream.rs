//! Upstream DNS resolution
//!
//! Queries that need a real answer are forwarded verbatim to an upstream
//! resolver. The wire bytes go out untouched so the response carries the
//! client's transaction id and flags.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

/// Default time to wait for an upstream answer
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest DNS message accepted over UDP (EDNS)
const MAX_UDP_MESSAGE: usize = 65535;

/// Something that answers DNS queries in wire format
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    /// Send `query` and return the raw response
    async fn query(&self, query: &[u8]) -> io::Result<Vec<u8>>;
}

/// Plain UDP upstream
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    /// Upstream at `server` with the default timeout
    #[must_use]
    pub const fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Override the response timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upstream address
    #[must_use]
    pub const fn server(&self) -> SocketAddr {
        self.server
    }
}

#[async_trait]
impl DnsUpstream for UdpUpstream {
    async fn query(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        if query.len() < 2 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "query too short"));
        }

        let bind: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        let exchange = async {
            loop {
                let n = socket.recv(&mut buf).await?;
                // Skip stray datagrams with another transaction id
                if n >= 2 && buf[..2] == query[..2] {
                    return Ok::<usize, io::Error>(n);
                }
                trace!("discarding mismatched upstream reply from {}", self.server);
            }
        };

        let n = timeout(self.timeout, exchange).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("upstream {} did not answer within {:?}", self.server, self.timeout),
            )
        })??;
        buf.truncate(n);
        Ok(buf)
    }
}
