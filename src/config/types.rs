//! Configuration types for intercept-proxy
//!
//! This module defines the on-disk configuration. Adapter and rule entries
//! are kept loose here (every field optional) so that the compile step can
//! report exactly what is missing; see [`super::compile`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fakedns::FakeIpConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy listener
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// DNS server and fake-IP pool
    #[serde(default)]
    pub dns: DnsConfig,

    /// Adapters, referenced by id from rules
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,

    /// Rules in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the scalar settings.
    ///
    /// Adapter and rule entries are checked when they are compiled.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.dns.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// A configuration that sends everything direct
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            adapters: vec![AdapterConfig::direct("direct")],
            rules: vec![RuleConfig::all("direct")],
            ..Self::default()
        }
    }
}

/// Proxy listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Port to listen on; 0 picks a free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Time allowed for a client to send its request head
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProxyConfig {
    /// Listen address and port together
    #[must_use]
    pub const fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    /// Request head timeout as a Duration
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate proxy settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero connection limit
    /// or timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation("proxy.max_connections must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "proxy.request_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            max_connections: default_max_connections(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// DNS server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Run the UDP DNS listener
    #[serde(default)]
    pub enabled: bool,

    /// UDP listen address
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Upstream resolver for real answers
    #[serde(default = "default_dns_upstream")]
    pub upstream: SocketAddr,

    /// Upstream response timeout
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Fake-IP pool
    #[serde(default)]
    pub fake_ip: FakeIpConfig,
}

impl DnsConfig {
    /// Upstream timeout as a Duration
    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Validate DNS settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero upstream timeout
    /// or an invalid fake-IP pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "dns.upstream_timeout_secs must be greater than 0",
            ));
        }
        self.fake_ip.validate()
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_dns_listen(),
            upstream: default_dns_upstream(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            fake_ip: FakeIpConfig::default(),
        }
    }
}

/// Adapter entry
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdapterConfig {
    /// Unique id that rules refer to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// "direct", "reject", "http" or "socks5"
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub adapter_type: Option<String>,

    /// Socket kind for direct adapters: "kernel" or "tunnel"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    /// Upstream proxy address for http and socks5 adapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<SocketAddr>,

    /// Upstream proxy username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Upstream proxy password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connect timeout override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

impl AdapterConfig {
    /// A direct adapter entry
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            adapter_type: Some("direct".into()),
            ..Self::default()
        }
    }

    /// A reject adapter entry
    pub fn reject(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            adapter_type: Some("reject".into()),
            ..Self::default()
        }
    }
}

/// Rule entry
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleConfig {
    /// "all", "iprange", "domainlist" or "dnsfail"
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,

    /// Adapter id to route matches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,

    /// iprange: CIDR blocks or "start+count" spans
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<String>,

    /// domainlist: exact names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    /// domainlist: suffixes (the name itself and any subdomain)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suffixes: Vec<String>,

    /// domainlist: substrings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// domainlist: regular expressions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regexes: Vec<String>,

    /// Telemetry description override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RuleConfig {
    /// A match-all rule entry
    pub fn all(adapter: impl Into<String>) -> Self {
        Self {
            rule_type: Some("all".into()),
            adapter: Some(adapter.into()),
            ..Self::default()
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl LogConfig {
    /// Validate the level name
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(()),
            other => Err(ConfigError::validation(format!("Unknown log level '{other}'"))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

// Default value functions for serde
const fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    9090
}

const fn default_max_connections() -> usize {
    1024
}

const fn default_request_timeout_secs() -> u64 {
    10
}

const fn default_dns_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5353)
}

const fn default_dns_upstream() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53)
}

const fn default_upstream_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".into()
}
