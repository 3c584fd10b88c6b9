//! Connect session: one outbound connection attempt

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::resolver::HostResolver;
use crate::fakedns::{DnsSession, FakeDnsManager};
use crate::packet::parse_ip_literal;
use crate::rules::Rule;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which party ended a session or caused its error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// The local proxy (client side, or the proxy shutting down)
    Proxy,
    /// The adapter or the remote end behind it
    Adapter,
    /// The tunnel carrying the traffic
    Tunnel,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Adapter => write!(f, "adapter"),
            Self::Tunnel => write!(f, "tunnel"),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    matched_rule: Option<Arc<Rule>>,
    error: Option<String>,
    error_source: Option<ErrorSource>,
    disconnect_source: Option<ErrorSource>,
}

/// One TCP/UDP connection request
///
/// `host` starts out as the requested host. When the request targets a
/// fake IP it is rewritten to the domain behind that fake IP, and the DNS
/// session's real address becomes the one `ip_address` reports.
pub struct ConnectSession {
    id: u64,
    requested_host: String,
    host: String,
    port: u16,
    fake_ip_enabled: bool,
    dns_session: Option<Arc<DnsSession>>,
    ip_address: OnceCell<Option<IpAddr>>,
    state: Mutex<SessionState>,
}

impl ConnectSession {
    /// Build a session for `host:port`.
    ///
    /// With `fake_ip_enabled` and a manager, an IP-form host inside the
    /// fake-IP block is translated back to its domain. Returns `None` when
    /// that translation fails: the mapping is unknown or has expired, so
    /// the real host cannot be recovered and the connection must be
    /// dropped.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        fake_ip_enabled: bool,
        fake_dns: Option<&FakeDnsManager>,
    ) -> Option<Self> {
        let requested_host = host.into();
        let mut host = requested_host.clone();
        let mut dns_session = None;

        if let (true, Some(manager), Some(ip)) =
            (fake_ip_enabled, fake_dns, parse_ip_literal(&requested_host))
        {
            if manager.is_fake_ip(ip) {
                let Some(session) = manager.lookup_fake_ip(ip) else {
                    warn!("no live mapping for fake ip {}, dropping connection", ip);
                    return None;
                };
                debug!("fake ip {} -> {}", ip, session.domain());
                host = session.domain().to_string();
                dns_session = Some(session);
            }
        }

        let matched_rule = dns_session
            .as_ref()
            .and_then(|s| s.matched_rule().cloned());

        Some(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            requested_host,
            host,
            port,
            fake_ip_enabled,
            dns_session,
            ip_address: OnceCell::new(),
            state: Mutex::new(SessionState {
                matched_rule,
                ..SessionState::default()
            }),
        })
    }

    /// Process-unique session id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Host exactly as requested
    #[must_use]
    pub fn requested_host(&self) -> &str {
        &self.requested_host
    }

    /// Host to connect to: the domain behind a fake IP, else the requested host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether fake-IP translation was requested for this session
    #[must_use]
    pub const fn fake_ip_enabled(&self) -> bool {
        self.fake_ip_enabled
    }

    /// The DNS session the fake IP was recovered from
    #[must_use]
    pub fn dns_session(&self) -> Option<&Arc<DnsSession>> {
        self.dns_session.as_ref()
    }

    /// Whether `host` was rewritten from a fake IP
    #[must_use]
    pub fn is_fake_ip_session(&self) -> bool {
        self.dns_session.is_some()
    }

    /// `host:port` in authority form, bracketing IPv6 literals
    #[must_use]
    pub fn authority(&self) -> String {
        match parse_ip_literal(&self.host) {
            Some(IpAddr::V6(v6)) => format!("[{v6}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Real IP address of `host`, resolved on first use and cached.
    ///
    /// Order: an IP-form host is its own address; a host recovered from a
    /// fake IP uses the DNS session's real answer when there was one;
    /// otherwise `resolver` is asked. `None` means resolution failed.
    pub async fn ip_address(&self, resolver: &dyn HostResolver) -> Option<IpAddr> {
        *self
            .ip_address
            .get_or_init(|| self.resolve_ip(resolver))
            .await
    }

    /// The cached address, if `ip_address` has already run
    #[must_use]
    pub fn cached_ip_address(&self) -> Option<Option<IpAddr>> {
        self.ip_address.get().copied()
    }

    async fn resolve_ip(&self, resolver: &dyn HostResolver) -> Option<IpAddr> {
        if let Some(ip) = parse_ip_literal(&self.host) {
            return Some(ip);
        }
        if let Some(ip) = self.dns_session.as_ref().and_then(|s| s.real_ip()) {
            return Some(ip);
        }
        match resolver.resolve(&self.host).await {
            Ok(ips) => ips.first().copied(),
            Err(e) => {
                debug!("session {} failed to resolve {}: {}", self.id, self.host, e);
                None
            }
        }
    }

    /// Rule that matched this session, if any
    #[must_use]
    pub fn matched_rule(&self) -> Option<Arc<Rule>> {
        self.state.lock().matched_rule.clone()
    }

    /// Record the rule that matched
    pub fn set_matched_rule(&self, rule: Arc<Rule>) {
        self.state.lock().matched_rule = Some(rule);
    }

    /// Attach an error and the party responsible for it
    pub fn record_error(&self, source: ErrorSource, error: impl Into<String>) {
        let mut state = self.state.lock();
        state.error = Some(error.into());
        state.error_source = Some(source);
    }

    /// Last recorded error
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Party responsible for the last recorded error
    #[must_use]
    pub fn error_source(&self) -> Option<ErrorSource> {
        self.state.lock().error_source
    }

    /// Mark the session disconnected by `source`.
    ///
    /// Only the first call takes effect and returns `true`.
    pub fn mark_disconnected(&self, source: ErrorSource) -> bool {
        let mut state = self.state.lock();
        if state.disconnect_source.is_some() {
            return false;
        }
        state.disconnect_source = Some(source);
        true
    }

    /// Party that ended the session, once it has ended
    #[must_use]
    pub fn disconnect_source(&self) -> Option<ErrorSource> {
        self.state.lock().disconnect_source
    }
}

impl fmt::Debug for ConnectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSession")
            .field("id", &self.id)
            .field("requested_host", &self.requested_host)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("fake_ip", &self.is_fake_ip_session())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.authority())
    }
}
