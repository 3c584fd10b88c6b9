//! Fake-IP pool configuration
//!
//! Deserialized from the `dns.fake_ip` section of the configuration file.
//!
//! ```json
//! { "enabled": true, "ipv4_pool": "198.18.0.0/15", "ttl_secs": 600 }
//! ```

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default fake-IP TTL in seconds
///
/// Also the TTL put on synthetic DNS answers, so a client never holds a
/// fake IP longer than we keep its reverse mapping.
pub const DEFAULT_FAKE_IP_TTL_SECS: u64 = 600;

/// Configuration for the fake-IP pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeIpConfig {
    /// Whether connect sessions translate fake IPs back to domains
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// IPv4 block handed out for A queries
    ///
    /// Default: 198.18.0.0/15 (RFC 2544 benchmarking range, never routed)
    #[serde(default = "default_ipv4_pool")]
    pub ipv4_pool: Ipv4Net,

    /// Optional IPv6 block for AAAA queries
    #[serde(default)]
    pub ipv6_pool: Option<Ipv6Net>,

    /// Upper bound on live mappings, independent of pool size
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Lifetime of a mapping; the fake IP is reclaimable once it elapses
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How often the background task sweeps expired mappings
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

const fn default_enabled() -> bool {
    true
}

fn default_ipv4_pool() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(198, 18, 0, 0), 15).expect("15 is a valid prefix")
}

const fn default_max_entries() -> usize {
    65536
}

const fn default_ttl_secs() -> u64 {
    DEFAULT_FAKE_IP_TTL_SECS
}

const fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for FakeIpConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ipv4_pool: default_ipv4_pool(),
            ipv6_pool: None,
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl FakeIpConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the IPv4 pool
    #[must_use]
    pub fn with_ipv4_pool(mut self, pool: Ipv4Net) -> Self {
        self.ipv4_pool = pool;
        self
    }

    /// Set the IPv6 pool, enabling AAAA answers
    #[must_use]
    pub fn with_ipv6_pool(mut self, pool: Ipv6Net) -> Self {
        self.ipv6_pool = Some(pool);
        self
    }

    /// Set the mapping lifetime
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// Set the maximum number of live mappings
    #[must_use]
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Enable or disable fake-IP translation
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Mapping lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Cleanup sweep interval
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero TTL, a zero entry
    /// limit or a pool too small to hold a single address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::validation("fake_ip.ttl_secs must be greater than 0"));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::validation(
                "fake_ip.max_entries must be greater than 0",
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::validation(
                "fake_ip.cleanup_interval_secs must be greater than 0",
            ));
        }
        if self.ipv4_pool.prefix_len() > 30 {
            return Err(ConfigError::validation(format!(
                "fake_ip.ipv4_pool {} is too small",
                self.ipv4_pool
            )));
        }
        if let Some(pool) = self.ipv6_pool {
            if pool.prefix_len() > 126 {
                return Err(ConfigError::validation(format!(
                    "fake_ip.ipv6_pool {pool} is too small"
                )));
            }
        }
        Ok(())
    }
}
