//! IP and DNS packet model
//!
//! Two parsers live here:
//!
//! - [`IpPacket`]: an IPv4/IPv6 header plus its TCP/UDP transport view,
//!   as delivered by the virtual interface.
//! - [`DnsMessage`]: a DNS wire-format message (queries and answers),
//!   backed by `hickory-proto`.
//!
//! Addresses and ports are plain [`std::net::IpAddr`] and `u16`; both are
//! `Copy`, hashable and convert to and from their presentation strings.
//!
//! # Example
//!
//! ```
//! use intercept_proxy::packet::parse_ip_literal;
//!
//! assert!(parse_ip_literal("10.1.2.3").is_some());
//! assert!(parse_ip_literal("[::1]").is_some());
//! assert!(parse_ip_literal("example.com").is_none());
//! ```

mod dns;
mod ip;

use std::net::IpAddr;

pub use dns::{DnsMessage, DnsMessageType};
pub use ip::{build_udp_reply, IpPacket, IpVersion, Transport, IPPROTO_TCP, IPPROTO_UDP};

/// Parse a host string as an IP literal.
///
/// Accepts bare IPv4/IPv6 text and bracketed IPv6 (`[::1]`). Returns
/// `None` for anything that is not IP-form, such as a domain name.
#[must_use]
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}
