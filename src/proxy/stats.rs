//! Proxy statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic proxy statistics
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted
    total_accepted: AtomicU64,
    /// Currently active connections
    active: AtomicU64,
    /// Connections that reached an adapter and finished relaying
    completed: AtomicU64,
    /// Connections dropped before or during the adapter connect
    errored: AtomicU64,
    /// Connections refused due to the connection limit
    rejected: AtomicU64,
    /// Total bytes client -> remote
    bytes_up: AtomicU64,
    /// Total bytes remote -> client
    bytes_down: AtomicU64,
}

impl ProxyStats {
    /// Create new statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new accepted connection
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished relay
    pub fn record_completed(&self, bytes_up: u64, bytes_down: u64) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes_down, Ordering::Relaxed);
    }

    /// Record a connection that ended without relaying
    pub fn record_error(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection refused at the limit
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total accepted connections
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Get currently active connections
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get completed connections
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get errored connections
    #[must_use]
    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    /// Get rejected connections
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            total_accepted: self.total_accepted(),
            active: self.active(),
            completed: self.completed(),
            errored: self.errored(),
            rejected: self.rejected(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Snapshot of proxy statistics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    /// Total connections accepted
    pub total_accepted: u64,
    /// Currently active connections
    pub active: u64,
    /// Completed connections
    pub completed: u64,
    /// Errored connections
    pub errored: u64,
    /// Rejected connections
    pub rejected: u64,
    /// Total bytes client -> remote
    pub bytes_up: u64,
    /// Total bytes remote -> client
    pub bytes_down: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}
