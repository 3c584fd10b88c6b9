//! Connection adapters
//!
//! An adapter opens the real connection for a matched session:
//!
//! - [`DirectAdapterFactory`]: straight to the destination's real address
//! - [`RejectAdapterFactory`]: refuse
//! - [`HttpAdapterFactory`]: through an upstream HTTP proxy (`CONNECT`)
//! - [`Socks5AdapterFactory`]: through an upstream SOCKS5 server
//!
//! All of them create sockets through a shared
//! [`RawSocketFactory`](crate::socket::RawSocketFactory), so each
//! connection lands on the tunnel or a kernel socket depending on what the
//! host has registered at that moment.

mod direct;
mod http;
mod registry;
mod reject;
mod socks5;
mod traits;

pub use direct::{DirectAdapterFactory, DEFAULT_CONNECT_TIMEOUT};
pub use http::HttpAdapterFactory;
pub use registry::AdapterRegistry;
pub use reject::RejectAdapterFactory;
pub use socks5::{Socks5AdapterFactory, Socks5Error};
pub use traits::{AdapterConnection, AdapterFactory, AdapterKind};
