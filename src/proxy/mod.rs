//! Local HTTP proxy
//!
//! Accepts `CONNECT` and absolute-form HTTP requests, routes each one
//! through the rule engine to an adapter and relays bytes until either
//! side closes.

mod handler;
pub mod http;
mod server;
mod stats;

pub use handler::SessionTable;
pub use http::{ProxyRequest, RequestError};
pub use server::{ProxyServer, ProxyState};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
