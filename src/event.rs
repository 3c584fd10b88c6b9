//! Telemetry events
//!
//! Components report what happened to a session through [`ProxyEvent`]s.
//! The host decides where they go by installing an [`EventSink`] with
//! [`set_sink`]; until then events are logged through `tracing`.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::rules::DnsMatchResult;
use crate::session::ErrorSource;

/// Something worth reporting about a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A rule matched the session
    RuleMatched {
        /// Session id
        session: u64,
        /// Rule description
        rule: String,
    },
    /// A rule was tested and did not match
    RuleDidNotMatch {
        /// Session id
        session: u64,
        /// Rule description
        rule: String,
    },
    /// An accepted connection was handed to an adapter
    ConnectionAccepted {
        /// Session id
        session: u64,
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Adapter id
        adapter: String,
    },
    /// An accepted connection was dropped before reaching an adapter
    ConnectionRejected {
        /// Requested host
        host: String,
        /// Requested port
        port: u16,
        /// Why it was dropped
        reason: String,
    },
    /// A session ended
    Disconnected {
        /// Session id
        session: u64,
        /// Side that ended it
        source: ErrorSource,
        /// Error that ended it, if any
        error: Option<String>,
    },
    /// A DNS query was answered
    DnsResolved {
        /// Queried domain
        domain: String,
        /// Fake IP handed out, if any
        fake_ip: Option<IpAddr>,
        /// Real address from upstream, if any
        real_ip: Option<IpAddr>,
        /// How the rules classified the query
        result: DnsMatchResult,
    },
}

/// Destination for telemetry events
pub trait EventSink: Send + Sync {
    /// Record one event; must not block
    fn record(&self, event: &ProxyEvent);
}

/// Sink that writes events to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ProxyEvent) {
        match event {
            ProxyEvent::RuleMatched { session, rule } => {
                debug!(session = *session, rule = %rule, "rule matched");
            }
            ProxyEvent::RuleDidNotMatch { session, rule } => {
                debug!(session = *session, rule = %rule, "rule did not match");
            }
            ProxyEvent::ConnectionAccepted {
                session,
                host,
                port,
                adapter,
            } => {
                info!(session = *session, host = %host, port = *port, adapter = %adapter, "connection accepted");
            }
            ProxyEvent::ConnectionRejected { host, port, reason } => {
                info!(host = %host, port = *port, reason = %reason, "connection rejected");
            }
            ProxyEvent::Disconnected {
                session,
                source,
                error: Some(error),
            } => {
                warn!(session = *session, source = %source, error = %error, "session disconnected with error");
            }
            ProxyEvent::Disconnected {
                session,
                source,
                error: None,
            } => {
                debug!(session = *session, source = %source, "session disconnected");
            }
            ProxyEvent::DnsResolved {
                domain,
                fake_ip,
                real_ip,
                result,
            } => {
                debug!(domain = %domain, ?fake_ip, ?real_ip, ?result, "dns resolved");
            }
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProxyEvent>>,
}

impl CollectingSink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().clone()
    }

    /// Take everything recorded so far
    pub fn drain(&self) -> Vec<ProxyEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events matching `pred`
    pub fn count(&self, pred: impl Fn(&ProxyEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: &ProxyEvent) {
        self.events.lock().push(event.clone());
    }
}

struct InstalledSink(Arc<dyn EventSink>);

static SINK: ArcSwapOption<InstalledSink> = ArcSwapOption::const_empty();

/// Install the process-wide sink, replacing any previous one
pub fn set_sink(sink: Arc<dyn EventSink>) {
    SINK.store(Some(Arc::new(InstalledSink(sink))));
}

/// Remove the process-wide sink; events fall back to [`TracingSink`]
pub fn clear_sink() {
    SINK.store(None);
}

/// Whether a sink other than the fallback is installed
#[must_use]
pub fn has_sink() -> bool {
    SINK.load().is_some()
}

/// Report an event to the current sink
pub fn emit(event: &ProxyEvent) {
    match SINK.load().as_ref() {
        Some(installed) => installed.0.record(event),
        None => TracingSink.record(event),
    }
}

/// Report to `sink` when a component was given its own, else to the
/// process-wide one
pub fn emit_to(sink: Option<&Arc<dyn EventSink>>, event: &ProxyEvent) {
    match sink {
        Some(sink) => sink.record(event),
        None => emit(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.record(&ProxyEvent::RuleMatched {
            session: 1,
            rule: "all".into(),
        });
        sink.record(&ProxyEvent::RuleDidNotMatch {
            session: 1,
            rule: "iprange".into(),
        });
        assert_eq!(sink.events().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, ProxyEvent::RuleMatched { .. })),
            1
        );
        assert_eq!(sink.drain().len(), 2);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_handles_every_variant() {
        let events = [
            ProxyEvent::ConnectionAccepted {
                session: 1,
                host: "example.com".into(),
                port: 443,
                adapter: "direct".into(),
            },
            ProxyEvent::ConnectionRejected {
                host: "198.18.0.9".into(),
                port: 80,
                reason: "unknown fake ip".into(),
            },
            ProxyEvent::Disconnected {
                session: 1,
                source: ErrorSource::Adapter,
                error: Some("reset".into()),
            },
            ProxyEvent::DnsResolved {
                domain: "example.com".into(),
                fake_ip: None,
                real_ip: None,
                result: DnsMatchResult::Pass,
            },
        ];
        for event in &events {
            TracingSink.record(event);
        }
    }
}
