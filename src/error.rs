//! Error types for intercept-proxy
//!
//! Errors are grouped by subsystem. Every enum exposes `is_recoverable()`
//! so callers can tell per-connection failures apart from fatal ones.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for intercept-proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Proxy listener lifecycle errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Adapter connection errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Fake-IP allocation errors
    #[error("Fake DNS error: {0}")]
    FakeDns(#[from] FakeDnsError),

    /// Packet parsing errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Proxy(e) => e.is_recoverable(),
            Self::Adapter(e) => e.is_recoverable(),
            Self::FakeDns(e) => e.is_recoverable(),
            Self::Packet(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
///
/// Loading is all-or-nothing: any of these aborts the load and the
/// previously installed configuration stays in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// The document is not valid JSON or has the wrong shape
    #[error("Invalid configuration file: {0}")]
    InvalidFile(String),

    /// A rule entry has no `type` field
    #[error("Rule #{index} is missing its type")]
    MissingRuleType { index: usize },

    /// A rule entry names a type we do not know
    #[error("Rule #{index} has unknown type '{kind}'")]
    UnknownRuleType { index: usize, kind: String },

    /// An adapter entry has no `id` field
    #[error("Adapter #{index} is missing its id")]
    MissingAdapterId { index: usize },

    /// An adapter entry has no `type` field
    #[error("Adapter '{id}' is missing its type")]
    MissingAdapterType { id: String },

    /// An adapter entry names a type we do not know
    #[error("Adapter '{id}' has unknown type '{kind}'")]
    UnknownAdapterType { id: String, kind: String },

    /// Two adapters share the same id
    #[error("Duplicate adapter id '{id}'")]
    DuplicateAdapterId { id: String },

    /// A rule points at an adapter id that is not registered
    #[error("Rule #{index} references unknown adapter '{id}'")]
    UnknownAdapterReference { index: usize, id: String },

    /// Malformed CIDR or start+count range
    #[error("Invalid IP range '{range}': {reason}")]
    InvalidIpRange { range: String, reason: String },

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create an invalid IP range error
    pub fn invalid_range(range: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIpRange {
            range: range.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Proxy server lifecycle errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// `start()` called while the server is already listening
    #[error("Proxy server is already started")]
    AlreadyStarted,

    /// `stop()` called while the server is not listening
    #[error("Proxy server is not started")]
    NotStarted,

    /// Accept loop failure
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// I/O error
    #[error("Proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::AlreadyStarted | Self::NotStarted => true,
            Self::AcceptError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Adapter connection errors
///
/// These are attached to the owning session; they never affect other
/// sessions.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Connection failed
    #[error("Failed to connect to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// Connection timeout
    #[error("Connection to {target} timed out after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },

    /// Upstream proxy refused or spoke the protocol wrong
    #[error("Upstream handshake with {server} failed: {reason}")]
    Handshake { server: SocketAddr, reason: String },

    /// Connection refused by a reject adapter
    #[error("Connection rejected by adapter {id}")]
    Rejected { id: String },

    /// Host could not be resolved to an address
    #[error("Failed to resolve host {host}")]
    Unresolved { host: String },

    /// Tunnel sockets are required but no provider is registered
    #[error("No tunnel provider registered")]
    TunnelUnavailable,

    /// Failed to set socket option (keepalive, nodelay)
    #[error("Failed to set adapter socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error during connection
    #[error("Adapter I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl AdapterError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::Handshake { .. } => true,
            Self::Rejected { .. } => false,
            Self::Unresolved { .. } => true,
            Self::TunnelUnavailable => true,
            Self::SocketOption { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(server: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Handshake {
            server,
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Fake-IP allocation errors
#[derive(Debug, Error)]
pub enum FakeDnsError {
    /// Every address in the pool is held by a live mapping
    #[error("Fake IP pool exhausted ({size} addresses in use)")]
    PoolExhausted { size: u64 },

    /// Domain name is empty or not representable in DNS
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// AAAA answer requested without an IPv6 pool configured
    #[error("IPv6 fake IP pool is not configured")]
    Ipv6Disabled,
}

impl FakeDnsError {
    /// Exhaustion clears once entries expire; the rest are permanent
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

/// Packet and DNS wire-format errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer is shorter than the header it claims to hold
    #[error("Packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    /// IP version nibble is neither 4 nor 6
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// DNS message failed to parse or serialize
    #[error("DNS wire error: {0}")]
    Dns(String),

    /// Payload does not fit in a single IP datagram
    #[error("Payload of {0} bytes does not fit in one IP packet")]
    TooLarge(usize),
}

impl PacketError {
    /// Create a truncated error
    pub const fn truncated(needed: usize, actual: usize) -> Self {
        Self::Truncated { needed, actual }
    }
}

/// Type alias for Result with the crate error
pub type Result<T> = std::result::Result<T, Error>;
