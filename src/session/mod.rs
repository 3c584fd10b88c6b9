//! Connect sessions
//!
//! A [`ConnectSession`] is built for every accepted connection. It carries
//! the requested host (which may be a fake IP), the host actually
//! connected to, the rule that matched and how the session ended.

mod connect;
mod resolver;

pub use connect::{ConnectSession, ErrorSource};
pub use resolver::{HostResolver, SystemResolver};
