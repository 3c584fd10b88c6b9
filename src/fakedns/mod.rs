//! Fake-IP DNS
//!
//! Domains routed to a remote adapter are answered with synthetic
//! addresses from a private pool. When a connection later targets one of
//! those addresses, [`FakeDnsManager::lookup_fake_ip`] recovers the
//! [`DnsSession`] that produced it, and with it the domain and the rule
//! that classified the query.
//!
//! ## Pieces
//!
//! - [`FakeIpConfig`]: pools, TTL and table bounds
//! - [`FakeDnsManager`]: the bidirectional fake IP table with expiry
//! - [`DnsServer`]: per-query decision between fake and real answers
//! - [`DnsUpstream`] / [`UdpUpstream`]: where real answers come from
//! - [`DnsUdpServer`]: plain UDP listener in front of a [`DnsServer`]
//!
//! ## Example
//!
//! ```
//! use intercept_proxy::fakedns::{FakeDnsManager, FakeIpConfig};
//!
//! let manager = FakeDnsManager::new(&FakeIpConfig::new());
//! let ip = manager.assign_fake_ip("tracker.example").unwrap();
//! assert!(manager.is_fake_ip(ip));
//! assert_eq!(manager.lookup_fake_ip(ip).unwrap().domain(), "tracker.example");
//! ```

pub mod config;
pub mod manager;
pub mod pool;
pub mod server;
mod session;
mod udp_server;
pub mod upstream;

pub use config::FakeIpConfig;
pub use manager::FakeDnsManager;
pub use server::{DnsServer, DNS_PORT};
pub use session::DnsSession;
pub use udp_server::DnsUdpServer;
pub use upstream::{DnsUpstream, UdpUpstream, DEFAULT_UPSTREAM_TIMEOUT};
