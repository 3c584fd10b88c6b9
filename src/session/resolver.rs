//! Host name resolution for connect sessions

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::trace;

/// Resolves a host name to addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `host`; an empty list means the name has no addresses
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        trace!("resolved {} -> {:?}", host, ips);
        Ok(ips)
    }
}
