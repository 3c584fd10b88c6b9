//! Hot-reloadable rule engine.
//!
//! The engine holds an immutable [`RuleSet`] behind an `ArcSwap`.
//! Evaluation loads the current snapshot without locking; a reload swaps
//! in a new snapshot atomically and in-flight evaluations finish on the
//! one they loaded.
//!
//! ```text
//! Connection -> RuleEngine::evaluate() -> ArcSwap::load() -> RuleSet
//!                                              |
//!                                       (lock-free read)
//!
//! Reload     -> RuleEngine::reload()   -> ArcSwap::store() -> old set dropped
//!                                                             when readers finish
//! ```

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use tracing::trace;

use super::rule::Rule;
use super::{DnsMatchResult, DnsPhase};
use crate::adapter::AdapterFactory;
use crate::event::{self, EventSink, ProxyEvent};
use crate::fakedns::DnsSession;
use crate::session::{ConnectSession, HostResolver, SystemResolver};

/// Ordered, immutable list of rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    version: u64,
}

/// A rule that classified a DNS session
#[derive(Debug, Clone)]
pub struct DnsRuleMatch {
    /// Position of the rule in the set
    pub index: usize,
    /// The rule
    pub rule: Arc<Rule>,
    /// Its verdict
    pub result: DnsMatchResult,
}

impl RuleSet {
    /// Build a set from rules in evaluation order
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            version: 0,
        }
    }

    /// Tag the set with a version number
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Version number of this set
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule from `start` onward whose DNS verdict is not `Pass`
    #[must_use]
    pub fn match_dns(&self, session: &DnsSession, phase: DnsPhase, start: usize) -> Option<DnsRuleMatch> {
        self.rules
            .iter()
            .enumerate()
            .skip(start)
            .find_map(|(index, rule)| match rule.match_dns(session, phase) {
                DnsMatchResult::Pass => None,
                result => Some(DnsRuleMatch {
                    index,
                    rule: Arc::clone(rule),
                    result,
                }),
            })
    }
}

/// Hot-reloadable rule engine.
///
/// Safe to share across threads; reads never block reloads.
pub struct RuleEngine {
    /// Current rule set (lock-free reads via `ArcSwap`)
    rules: ArcSwap<RuleSet>,
    resolver: Arc<dyn HostResolver>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RuleEngine {
    /// Engine resolving hosts through the system resolver
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self::with_resolver(rules, Arc::new(SystemResolver))
    }

    /// Engine resolving hosts through `resolver`
    #[must_use]
    pub fn with_resolver(rules: RuleSet, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            resolver,
            sink: None,
        }
    }

    /// Report rule telemetry to `sink` instead of the process-wide sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Current rule set (lock-free read).
    ///
    /// The guard keeps the snapshot alive, so a caller that evaluates in
    /// several steps sees one consistent set.
    pub fn load(&self) -> Guard<Arc<RuleSet>> {
        self.rules.load()
    }

    /// Swap in a new rule set
    pub fn reload(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
    }

    /// Version of the current rule set
    #[must_use]
    pub fn version(&self) -> u64 {
        self.rules.load().version
    }

    /// Resolver used for IP-based rules
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn HostResolver> {
        &self.resolver
    }

    /// Pick the adapter for a connect session.
    ///
    /// A rule carried over from the session's DNS query is tried first,
    /// provided it belongs to the current rule set; after a reload it is
    /// ignored.
    /// Then the rules run in order and the first match wins. `None` means
    /// nothing matched; there is no implicit default.
    ///
    /// Every rule tested is reported as a `RuleMatched` or
    /// `RuleDidNotMatch` event, and the winning rule is recorded on the
    /// session.
    pub async fn evaluate(&self, session: &ConnectSession) -> Option<Arc<dyn AdapterFactory>> {
        let rules = self.rules.load_full();
        let resolver = self.resolver.as_ref();

        // A rule carried over from the DNS query only counts while it is
        // still part of the current set.
        if let Some(rule) = session.matched_rule() {
            if rules.rules().iter().any(|r| Arc::ptr_eq(r, &rule)) {
                if let Some(adapter) = self.test(&rule, session, resolver).await {
                    return Some(adapter);
                }
            } else {
                trace!(
                    "session {} carries rule '{}' from a replaced rule set, ignoring it",
                    session.id(),
                    rule
                );
            }
        }

        for rule in rules.rules() {
            if let Some(adapter) = self.test(rule, session, resolver).await {
                return Some(adapter);
            }
        }

        trace!("no rule matched session {}", session.id());
        None
    }

    async fn test(
        &self,
        rule: &Arc<Rule>,
        session: &ConnectSession,
        resolver: &dyn HostResolver,
    ) -> Option<Arc<dyn AdapterFactory>> {
        let adapter = rule.matches(session, resolver).await;
        let event = if adapter.is_some() {
            session.set_matched_rule(Arc::clone(rule));
            ProxyEvent::RuleMatched {
                session: session.id(),
                rule: rule.description().to_string(),
            }
        } else {
            ProxyEvent::RuleDidNotMatch {
                session: session.id(),
                rule: rule.description().to_string(),
            }
        };
        event::emit_to(self.sink.as_ref(), &event);
        adapter
    }

    /// Classify a DNS session against the current rules.
    ///
    /// Returns the first rule whose verdict is not `Pass`, or `(None, Pass)`
    /// when every rule passes.
    #[must_use]
    pub fn match_dns(&self, session: &DnsSession, phase: DnsPhase) -> (Option<Arc<Rule>>, DnsMatchResult) {
        match self.rules.load().match_dns(session, phase, 0) {
            Some(m) => (Some(m.rule), m.result),
            None => (None, DnsMatchResult::Pass),
        }
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rules = self.rules.load();
        f.debug_struct("RuleEngine")
            .field("rules", &rules.len())
            .field("version", &rules.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RejectAdapterFactory;
    use crate::event::CollectingSink;
    use crate::rules::{DomainSet, IpRangeSet};
    use async_trait::async_trait;
    use std::io;
    use std::net::IpAddr;

    struct FixedResolver(Option<IpAddr>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            Ok(self.0.into_iter().collect())
        }
    }

    fn adapter(id: &str) -> Arc<dyn AdapterFactory> {
        Arc::new(RejectAdapterFactory::new(id))
    }

    fn engine(rules: Vec<Rule>, answer: Option<&str>) -> (RuleEngine, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let resolver = Arc::new(FixedResolver(answer.map(|a| a.parse().unwrap())));
        let engine = RuleEngine::with_resolver(RuleSet::new(rules), resolver).with_sink(sink.clone());
        (engine, sink)
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let ranges = IpRangeSet::parse(&["10.0.0.0/8"]).unwrap();
        let (engine, sink) = engine(
            vec![
                Rule::ip_range_list(ranges, adapter("lan")),
                Rule::all(adapter("tunnel")),
            ],
            None,
        );

        let lan = ConnectSession::new("10.1.2.3", 22, false, None).unwrap();
        assert_eq!(engine.evaluate(&lan).await.unwrap().id(), "lan");
        assert_eq!(lan.matched_rule().unwrap().adapter().id(), "lan");

        let wan = ConnectSession::new("93.184.216.34", 443, false, None).unwrap();
        assert_eq!(engine.evaluate(&wan).await.unwrap().id(), "tunnel");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ProxyEvent::RuleMatched { session, .. } if *session == lan.id()));
        assert!(matches!(&events[1], ProxyEvent::RuleDidNotMatch { session, .. } if *session == wan.id()));
        assert!(matches!(&events[2], ProxyEvent::RuleMatched { rule, .. } if rule == "all -> tunnel"));
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let domains = DomainSet::builder().add_exact("ads.example").build().unwrap();
        let (engine, sink) = engine(vec![Rule::domain_list(domains, adapter("block"))], None);

        let session = ConnectSession::new("example.org", 80, false, None).unwrap();
        assert!(engine.evaluate(&session).await.is_none());
        assert!(session.matched_rule().is_none());
        assert_eq!(sink.count(|e| matches!(e, ProxyEvent::RuleDidNotMatch { .. })), 1);
    }

    #[tokio::test]
    async fn test_empty_engine() {
        let (engine, _sink) = engine(Vec::new(), None);
        let session = ConnectSession::new("example.org", 80, false, None).unwrap();
        assert!(engine.evaluate(&session).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_swaps_rules() {
        let (engine, _sink) = engine(vec![Rule::all(adapter("old"))], None);
        let session = ConnectSession::new("example.org", 80, false, None).unwrap();
        assert_eq!(engine.evaluate(&session).await.unwrap().id(), "old");

        let snapshot = engine.load();
        engine.reload(RuleSet::new(vec![Rule::all(adapter("new"))]).with_version(2));
        assert_eq!(engine.version(), 2);
        // The guard taken before the reload still sees the old set
        assert_eq!(snapshot.rules()[0].adapter().id(), "old");

        let session = ConnectSession::new("example.org", 80, false, None).unwrap();
        assert_eq!(engine.evaluate(&session).await.unwrap().id(), "new");
    }

    #[tokio::test]
    async fn test_carried_rule_tried_first() {
        let (engine, sink) = engine(
            vec![Rule::all(adapter("first")), Rule::all(adapter("second"))],
            None,
        );
        let carried = Arc::clone(&engine.load().rules()[1]);
        let session = ConnectSession::new("example.org", 80, false, None).unwrap();
        session.set_matched_rule(carried);

        assert_eq!(engine.evaluate(&session).await.unwrap().id(), "second");
        assert_eq!(sink.count(|e| matches!(e, ProxyEvent::RuleMatched { .. })), 1);
    }

    #[tokio::test]
    async fn test_carried_rule_ignored_after_reload() {
        let domains = DomainSet::builder().add_suffix("tracker.example").build().unwrap();
        let (engine, sink) = engine(
            vec![Rule::domain_list(domains.clone(), adapter("upstream")), Rule::all(adapter("direct"))],
            None,
        );
        let stale = Arc::clone(&engine.load().rules()[0]);

        engine.reload(
            RuleSet::new(vec![Rule::domain_list(domains, adapter("block")), Rule::all(adapter("direct"))])
                .with_version(2),
        );

        let session = ConnectSession::new("cdn.tracker.example", 443, false, None).unwrap();
        session.set_matched_rule(stale);
        assert_eq!(engine.evaluate(&session).await.unwrap().id(), "block");
        assert_eq!(session.matched_rule().unwrap().adapter().id(), "block");
        // The stale rule is never tested or reported
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_dns_fail_rule_via_resolver() {
        let (engine, _sink) = engine(
            vec![Rule::dns_fail(adapter("remote-resolve")), Rule::all(adapter("direct"))],
            None,
        );
        let session = ConnectSession::new("nx.example", 80, false, None).unwrap();
        assert_eq!(engine.evaluate(&session).await.unwrap().id(), "remote-resolve");
    }
}
