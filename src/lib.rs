//! intercept-proxy: local interception proxy for app-tracking protection
//!
//! This crate provides the network-interception half of a tracking
//! protection packet tunnel: a local HTTP proxy and a fake-IP DNS server
//! that classify every flow against ordered rules and hand it to a
//! pluggable connection adapter.
//!
//! # Features
//!
//! - **Rule Engine**: match-all, IP-range, domain-list and DNS-failure rules, hot reloadable
//! - **Fake-IP DNS**: synthetic answers that map back to the queried domain
//! - **Adapters**: direct (kernel or tunnel socket), reject, HTTP and SOCKS5 upstreams
//! - **Telemetry**: rule-match, connection and DNS events through a replaceable sink
//!
//! # Architecture
//!
//! ```text
//! DNS query ──▶ DnsServer ──▶ rules (domain/ip phase) ──▶ fake IP | real answer
//!
//! Client ──▶ ProxyServer ──▶ ConnectSession ──▶ RuleEngine ──▶ AdapterFactory
//!                (fake IP → domain)                                │
//!                                                    RawSocketFactory (kernel | tunnel)
//!                                                                  │
//!                                   relay ◀────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use intercept_proxy::config::{load_config, Configuration};
//! use intercept_proxy::proxy::ProxyServer;
//! use intercept_proxy::rules::RuleEngine;
//! use intercept_proxy::socket::RawSocketFactory;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/intercept-proxy/config.json")?;
//! let compiled = Configuration::compile(config, &Arc::new(RawSocketFactory::new()), 1)?;
//!
//! let rules = Arc::new(RuleEngine::new(compiled.rules));
//! let server = ProxyServer::new(&compiled.settings.proxy, rules, None);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapter`]: Connection adapters and their registry
//! - [`config`]: Configuration types, loading and compilation
//! - [`error`]: Error types
//! - [`event`]: Telemetry events and sinks
//! - [`fakedns`]: Fake-IP table and DNS server
//! - [`io`]: Relay utilities
//! - [`packet`]: IP and DNS packet model
//! - [`proxy`]: Proxy server
//! - [`rules`]: Rule engine
//! - [`session`]: Connect sessions and host resolution
//! - [`socket`]: Tunnel-aware socket factory

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod event;
pub mod fakedns;
pub mod io;
pub mod packet;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod socket;

// Re-export commonly used types at the crate root
pub use adapter::{AdapterFactory, AdapterKind, AdapterRegistry};
pub use config::{Config, Configuration};
pub use error::{AdapterError, ConfigError, Error, FakeDnsError, PacketError, ProxyError};
pub use event::{EventSink, ProxyEvent};
pub use fakedns::{DnsServer, DnsSession, FakeDnsManager};
pub use proxy::{ProxyServer, ProxyState};
pub use rules::{Rule, RuleEngine, RuleSet};
pub use session::{ConnectSession, ErrorSource};
pub use socket::{RawSocketFactory, SocketKind, TunnelProvider, TunnelProviderSlot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
