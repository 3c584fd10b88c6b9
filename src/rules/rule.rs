//! Rule definitions
//!
//! A rule pairs a matching criterion with the adapter that handles
//! whatever it matches. Rules are evaluated twice in a session's life:
//!
//! 1. When the DNS query for a domain arrives ([`Rule::match_dns`]), to
//!    decide between a fake answer, a real answer or "look further".
//! 2. When the connection arrives ([`Rule::matches`]), to pick the adapter.

use std::fmt;
use std::sync::Arc;

use super::domain::DomainSet;
use super::ip_range::IpRangeSet;
use super::{DnsMatchResult, DnsPhase};
use crate::adapter::AdapterFactory;
use crate::fakedns::DnsSession;
use crate::session::{ConnectSession, HostResolver};

/// Matching criterion
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Matches everything
    All,
    /// Matches when the destination address falls in a range
    IpRangeList(IpRangeSet),
    /// Matches when the destination host is in a domain set
    DomainList(DomainSet),
    /// Matches when the destination host cannot be resolved
    DnsFail,
}

impl RuleKind {
    /// Short type name, as used in configuration
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::IpRangeList(_) => "iprange",
            Self::DomainList(_) => "domainlist",
            Self::DnsFail => "dnsfail",
        }
    }
}

/// A routing rule
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    adapter: Arc<dyn AdapterFactory>,
    description: String,
}

impl Rule {
    /// Build a rule of any kind
    pub fn new(kind: RuleKind, adapter: Arc<dyn AdapterFactory>) -> Self {
        let description = match &kind {
            RuleKind::All => format!("all -> {}", adapter.id()),
            RuleKind::IpRangeList(set) => format!("iprange({}) -> {}", set.len(), adapter.id()),
            RuleKind::DomainList(set) => format!("domainlist({}) -> {}", set.len(), adapter.id()),
            RuleKind::DnsFail => format!("dnsfail -> {}", adapter.id()),
        };
        Self {
            kind,
            adapter,
            description,
        }
    }

    /// Match-all rule
    pub fn all(adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::new(RuleKind::All, adapter)
    }

    /// IP range rule
    pub fn ip_range_list(ranges: IpRangeSet, adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::new(RuleKind::IpRangeList(ranges), adapter)
    }

    /// Domain list rule
    pub fn domain_list(domains: DomainSet, adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::new(RuleKind::DomainList(domains), adapter)
    }

    /// Resolution-failure rule
    pub fn dns_fail(adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::new(RuleKind::DnsFail, adapter)
    }

    /// Replace the generated description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Human-readable description used in telemetry
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The criterion
    #[must_use]
    pub const fn kind(&self) -> &RuleKind {
        &self.kind
    }

    /// The adapter factory this rule routes to
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn AdapterFactory> {
        &self.adapter
    }

    /// Test a connect session against this rule.
    ///
    /// Returns the adapter factory on a match. IP-based criteria resolve
    /// the session's address through `resolver`; the session caches it.
    pub async fn matches(
        &self,
        session: &ConnectSession,
        resolver: &dyn HostResolver,
    ) -> Option<Arc<dyn AdapterFactory>> {
        let matched = match &self.kind {
            RuleKind::All => true,
            RuleKind::DomainList(domains) => domains.matches(session.host()),
            RuleKind::IpRangeList(ranges) => session
                .ip_address(resolver)
                .await
                .is_some_and(|ip| ranges.contains(ip)),
            RuleKind::DnsFail => session.ip_address(resolver).await.is_none(),
        };
        matched.then(|| Arc::clone(&self.adapter))
    }

    /// Classify a DNS session in the given phase.
    ///
    /// In the [`DnsPhase::Domain`] phase only the queried name is known;
    /// criteria that need the real address answer `Unknown`. In the
    /// [`DnsPhase::Ip`] phase the real response has been recorded on the
    /// session.
    #[must_use]
    pub fn match_dns(&self, session: &DnsSession, phase: DnsPhase) -> DnsMatchResult {
        match (&self.kind, phase) {
            (RuleKind::All, _) => self.hit(),
            (RuleKind::DomainList(domains), _) => {
                if domains.matches(session.domain()) {
                    self.hit()
                } else {
                    DnsMatchResult::Pass
                }
            }
            (RuleKind::IpRangeList(_) | RuleKind::DnsFail, DnsPhase::Domain) => DnsMatchResult::Unknown,
            (RuleKind::IpRangeList(ranges), DnsPhase::Ip) => match session.real_ip() {
                Some(ip) if ranges.contains(ip) => DnsMatchResult::Real,
                _ => DnsMatchResult::Pass,
            },
            (RuleKind::DnsFail, DnsPhase::Ip) => {
                if session.real_ip().is_none() {
                    DnsMatchResult::Real
                } else {
                    DnsMatchResult::Pass
                }
            }
        }
    }

    /// Result for a name-based match: fake unless the adapter needs the
    /// real address
    fn hit(&self) -> DnsMatchResult {
        if self.adapter.resolves_locally() {
            DnsMatchResult::Real
        } else {
            DnsMatchResult::Fake
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}
