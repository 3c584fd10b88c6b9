//! Rule engine module for routing decisions
//!
//! This module provides:
//! - Rule definitions ([`Rule`], [`RuleKind`])
//! - Domain matching ([`DomainSet`])
//! - IP range matching ([`IpRangeSet`])
//! - Hot-reloadable rule engine ([`RuleEngine`])
//!
//! # Architecture
//!
//! Rules are evaluated in declaration order and the first match picks the
//! adapter. There is no implicit default: a connection nothing matches is
//! dropped, so configurations normally end with an `all` rule.
//!
//! Rules also answer DNS queries before any connection exists. A rule
//! whose adapter resolves remotely can hand out a fake IP; the connection
//! to that fake IP later comes back to the same rule.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use intercept_proxy::adapter::RejectAdapterFactory;
//! use intercept_proxy::rules::{DomainSet, Rule, RuleEngine, RuleSet};
//!
//! let block = Arc::new(RejectAdapterFactory::new("block"));
//! let trackers = DomainSet::builder().add_suffix("tracker.example").build().unwrap();
//!
//! let engine = RuleEngine::new(RuleSet::new(vec![Rule::domain_list(trackers, block)]));
//! assert_eq!(engine.load().len(), 1);
//! ```

pub mod domain;
pub mod engine;
pub mod ip_range;
mod rule;

pub use domain::{DomainSet, DomainSetBuilder};
pub use engine::{DnsRuleMatch, RuleEngine, RuleSet};
pub use ip_range::{IpRange, IpRangeSet};
pub use rule::{Rule, RuleKind};

/// How a rule classifies a DNS query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsMatchResult {
    /// Answer with a fake IP
    Fake,
    /// Answer with the real upstream response
    Real,
    /// Cannot decide without the real answer; resolve and ask again
    Unknown,
    /// Not this rule; try the next one
    Pass,
}

/// Which information a DNS classification can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsPhase {
    /// Only the queried name is known
    Domain,
    /// The real upstream response has been recorded on the session
    Ip,
}
