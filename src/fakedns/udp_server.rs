//! DNS over UDP listener
//!
//! Receives plain DNS queries on a socket and answers them through a
//! [`DnsServer`]. Each query runs in its own task so a slow upstream does
//! not hold up locally answered names.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, trace};

use super::server::DnsServer;

/// UDP front end for a [`DnsServer`]
pub struct DnsUdpServer {
    socket: Arc<UdpSocket>,
    server: Arc<DnsServer>,
}

impl DnsUdpServer {
    /// Bind to the given address
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, server: Arc<DnsServer>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            server,
        })
    }

    /// Get the local address of the server
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve queries until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // EDNS allows up to 65535 bytes
        let mut buffer = vec![0u8; 65535];
        if let Ok(addr) = self.socket.local_addr() {
            info!("DNS listening on udp://{}", addr);
        }

        loop {
            let (n, peer_addr) = tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok(r) => r,
                    Err(err) => {
                        error!("DNS UDP recv error: {}", err);
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("DNS UDP listener stopping");
                        return;
                    }
                    continue;
                }
            };

            trace!("DNS UDP received {} bytes from {}", n, peer_addr);
            let query = buffer[..n].to_vec();
            let socket = Arc::clone(&self.socket);
            let server = Arc::clone(&self.server);

            tokio::spawn(async move {
                let Some(response) = server.handle_query(&query).await else {
                    debug!("DNS UDP dropped query from {}", peer_addr);
                    return;
                };
                if let Err(err) = socket.send_to(&response, peer_addr).await {
                    debug!("DNS UDP send error to {}: {}", peer_addr, err);
                }
            });
        }
    }
}
