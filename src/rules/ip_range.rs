//! IP range lists
//!
//! Ranges are written either as CIDR (`10.0.0.0/8`, `fd00::/8`) or as a
//! start address plus a count (`192.168.1.10+16`, covering `.10` through
//! `.25`). Both forms are parsed and validated when the configuration is
//! loaded, so matching never fails.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::ConfigError;

/// One contiguous address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    /// CIDR block
    Cidr(IpNet),
    /// `count` addresses starting at `start`, same family throughout
    Span { start: IpAddr, count: u128 },
}

impl IpRange {
    /// Whether `ip` falls inside the range
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match self {
            Self::Cidr(net) => net.contains(&ip),
            Self::Span { start, count } => match (start, ip) {
                (IpAddr::V4(s), IpAddr::V4(ip)) => {
                    let offset = u32::from(ip).wrapping_sub(u32::from(*s));
                    u32::from(ip) >= u32::from(*s) && u128::from(offset) < *count
                }
                (IpAddr::V6(s), IpAddr::V6(ip)) => {
                    let (s, ip) = (u128::from(*s), u128::from(ip));
                    ip >= s && ip - s < *count
                }
                _ => false,
            },
        }
    }
}

impl FromStr for IpRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Some((start, count)) = text.split_once('+') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_range(s, "start is not an IP address"))?;
            let count: u128 = count
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_range(s, "count is not a number"))?;
            if count == 0 {
                return Err(ConfigError::invalid_range(s, "count must be at least 1"));
            }
            let room = match start {
                IpAddr::V4(v4) => u128::from(u32::MAX - u32::from(v4)) + 1,
                IpAddr::V6(v6) => (u128::MAX - u128::from(v6)).saturating_add(1),
            };
            if count > room {
                return Err(ConfigError::invalid_range(s, "range runs past the end of the address space"));
            }
            return Ok(Self::Span { start, count });
        }

        if text.contains('/') {
            return text
                .parse::<IpNet>()
                .map(|net| Self::Cidr(net.trunc()))
                .map_err(|e| ConfigError::invalid_range(s, e.to_string()));
        }

        // A bare address is a single-host range
        text.parse::<IpAddr>()
            .map(|ip| Self::Cidr(IpNet::from(ip)))
            .map_err(|_| ConfigError::invalid_range(s, "expected CIDR, address or start+count"))
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(net) => write!(f, "{net}"),
            Self::Span { start, count } => write!(f, "{start}+{count}"),
        }
    }
}

/// Ordered list of ranges; matches if any range contains the address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRangeSet {
    ranges: Vec<IpRange>,
}

impl IpRangeSet {
    /// Parse every entry, failing on the first malformed one
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidIpRange` naming the bad entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let ranges = entries
            .iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<IpRange>, _>>()?;
        Ok(Self { ranges })
    }

    /// Whether any range contains `ip`
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }

    /// The parsed ranges
    #[must_use]
    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// Number of ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the set has no ranges
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr() {
        let set = IpRangeSet::parse(&["10.0.0.0/8", "fd00::/8"]).unwrap();
        assert!(set.contains(ip("10.1.2.3")));
        assert!(set.contains(ip("fd12::1")));
        assert!(!set.contains(ip("8.8.8.8")));
        assert!(!set.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_start_plus_count() {
        let range: IpRange = "192.168.1.10+16".parse().unwrap();
        assert!(range.contains(ip("192.168.1.10")));
        assert!(range.contains(ip("192.168.1.25")));
        assert!(!range.contains(ip("192.168.1.26")));
        assert!(!range.contains(ip("192.168.1.9")));
        assert!(!range.contains(ip("::1")));
        assert_eq!(range.to_string(), "192.168.1.10+16");
    }

    #[test]
    fn test_bare_address() {
        let range: IpRange = "1.1.1.1".parse().unwrap();
        assert!(range.contains(ip("1.1.1.1")));
        assert!(!range.contains(ip("1.1.1.2")));
    }

    #[test]
    fn test_invalid_ranges() {
        for bad in ["10.0.0.0/33", "not-an-ip", "10.0.0.1+0", "10.0.0.1+abc", "255.255.255.255+2"] {
            let err = bad.parse::<IpRange>().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidIpRange { ref range, .. } if range == bad),
                "{bad} -> {err}"
            );
        }
    }

    #[test]
    fn test_unaligned_cidr_truncated() {
        let range: IpRange = "10.1.2.3/8".parse().unwrap();
        assert_eq!(range.to_string(), "10.0.0.0/8");
    }
}
