//! Fake-IP address pools
//!
//! A pool walks its block with a wrapping cursor. It hands out candidates
//! only; whether a candidate is free is decided by the owning table, which
//! holds the pool under the same lock as the maps.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// Wrapping cursor over the usable addresses of a fake-IP block
///
/// The network address is never handed out, and for IPv4 neither is the
/// broadcast address.
#[derive(Debug, Clone)]
pub struct FakeIpPool {
    base: u128,
    first: u128,
    count: u128,
    cursor: u128,
    family: Family,
    net: ipnet::IpNet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl FakeIpPool {
    /// Pool over an IPv4 block
    #[must_use]
    pub fn v4(net: Ipv4Net) -> Self {
        let net = net.trunc();
        let span = 1u128 << (32 - u32::from(net.prefix_len()));
        let (first, count) = if span > 2 { (1, span - 2) } else { (0, span) };
        Self {
            base: u128::from(u32::from(net.network())),
            first,
            count,
            cursor: 0,
            family: Family::V4,
            net: net.into(),
        }
    }

    /// Pool over an IPv6 block
    ///
    /// Blocks wider than 2^64 are clamped; nobody maps that many domains.
    #[must_use]
    pub fn v6(net: Ipv6Net) -> Self {
        let net = net.trunc();
        let host_bits = 128 - u32::from(net.prefix_len());
        let span = if host_bits >= 64 { 1u128 << 64 } else { 1u128 << host_bits };
        let (first, count) = if span > 1 { (1, span - 1) } else { (0, span) };
        Self {
            base: u128::from(net.network()),
            first,
            count,
            cursor: 0,
            family: Family::V6,
            net: net.into(),
        }
    }

    /// Next candidate address, wrapping at the end of the block
    pub fn next_candidate(&mut self) -> IpAddr {
        let offset = self.first + self.cursor;
        self.cursor = (self.cursor + 1) % self.count;
        let raw = self.base + offset;
        match self.family {
            // base + offset stays inside the /n block, so this fits in 32 bits
            Family::V4 => IpAddr::V4(Ipv4Addr::from(raw as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(raw)),
        }
    }

    /// Whether `ip` falls inside this block
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.net.contains(&ip)
    }

    /// Number of addresses the pool can hand out
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.count).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_skips_network_and_broadcast() {
        let mut pool = FakeIpPool::v4("10.0.0.0/30".parse().unwrap());
        assert_eq!(pool.size(), 2);

        let a = pool.next_candidate();
        let b = pool.next_candidate();
        let c = pool.next_candidate();
        assert_eq!(a, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(b, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(c, a);
    }

    #[test]
    fn test_v4_default_block_size() {
        let pool = FakeIpPool::v4("198.18.0.0/15".parse().unwrap());
        assert_eq!(pool.size(), 131_070);
        assert!(pool.contains("198.19.255.1".parse().unwrap()));
        assert!(!pool.contains("198.20.0.1".parse().unwrap()));
    }

    #[test]
    fn test_v6_pool() {
        let mut pool = FakeIpPool::v6("fc00::/120".parse().unwrap());
        assert_eq!(pool.size(), 255);
        assert_eq!(pool.next_candidate(), "fc00::1".parse::<IpAddr>().unwrap());
        assert!(pool.contains("fc00::ff".parse().unwrap()));
        assert!(!pool.contains("fc00::100".parse().unwrap()));
        assert!(!pool.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_unaligned_block_is_truncated() {
        let mut pool = FakeIpPool::v4("192.168.1.77/24".parse().unwrap());
        assert_eq!(pool.next_candidate(), "192.168.1.1".parse::<IpAddr>().unwrap());
    }
}
