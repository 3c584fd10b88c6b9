//! Turning configuration entries into live objects
//!
//! Compilation is all-or-nothing: the first bad entry aborts it and
//! nothing is returned, so a failed reload never half-installs rules.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::types::{AdapterConfig, Config, RuleConfig};
use crate::adapter::{
    AdapterFactory, AdapterRegistry, DirectAdapterFactory, HttpAdapterFactory, RejectAdapterFactory,
    Socks5AdapterFactory,
};
use crate::error::ConfigError;
use crate::rules::{DomainSet, IpRangeSet, Rule, RuleKind, RuleSet};
use crate::socket::{RawSocketFactory, SocketKind};

/// A loaded configuration with its adapters and rules built
#[derive(Debug)]
pub struct Configuration {
    /// The settings it was built from
    pub settings: Config,
    /// Adapters by id
    pub adapters: AdapterRegistry,
    /// Rules in evaluation order
    pub rules: RuleSet,
}

impl Configuration {
    /// Validate `settings` and build its adapters and rules.
    ///
    /// `version` tags the resulting rule set.
    ///
    /// # Errors
    ///
    /// The first `ConfigError` encountered.
    pub fn compile(
        settings: Config,
        sockets: &Arc<RawSocketFactory>,
        version: u64,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let adapters = build_adapters(&settings.adapters, sockets)?;
        let rules = build_rules(&settings.rules, &adapters)?.with_version(version);
        info!(
            "configuration compiled: {} adapters, {} rules (version {})",
            adapters.len(),
            rules.len(),
            version
        );
        Ok(Self {
            settings,
            adapters,
            rules,
        })
    }
}

/// Build every adapter entry into a registry
///
/// # Errors
///
/// `MissingAdapterId`, `MissingAdapterType`, `UnknownAdapterType`,
/// `DuplicateAdapterId`, or `ValidationError` for a bad field.
pub fn build_adapters(
    entries: &[AdapterConfig],
    sockets: &Arc<RawSocketFactory>,
) -> Result<AdapterRegistry, ConfigError> {
    let mut registry = AdapterRegistry::new();
    for (index, entry) in entries.iter().enumerate() {
        let adapter = build_adapter(index, entry, sockets)?;
        debug!("adapter '{}' ({})", adapter.id(), adapter.kind());
        registry.register(adapter)?;
    }
    Ok(registry)
}

fn build_adapter(
    index: usize,
    entry: &AdapterConfig,
    sockets: &Arc<RawSocketFactory>,
) -> Result<Arc<dyn AdapterFactory>, ConfigError> {
    let id = match entry.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(ConfigError::MissingAdapterId { index }),
    };
    let Some(kind) = entry.adapter_type.as_deref() else {
        return Err(ConfigError::MissingAdapterType { id });
    };
    let timeout = match entry.connect_timeout_secs {
        Some(0) => {
            return Err(ConfigError::validation(format!(
                "Adapter '{id}' connect_timeout_secs must be greater than 0"
            )))
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    let adapter: Arc<dyn AdapterFactory> = match kind.to_ascii_lowercase().as_str() {
        "direct" => {
            let socket = match entry.socket.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None => None,
                Some("kernel") => Some(SocketKind::Kernel),
                Some("tunnel") => Some(SocketKind::Tunnel),
                Some(other) => {
                    return Err(ConfigError::validation(format!(
                        "Adapter '{id}' has unknown socket kind '{other}'"
                    )))
                }
            };
            let mut direct = DirectAdapterFactory::new(id, Arc::clone(sockets)).with_socket(socket);
            if let Some(timeout) = timeout {
                direct = direct.with_timeout(timeout);
            }
            Arc::new(direct)
        }
        "reject" => Arc::new(RejectAdapterFactory::new(id)),
        "http" => {
            let server = require_server(&id, entry)?;
            let mut http = HttpAdapterFactory::new(id, server, Arc::clone(sockets));
            if let Some((user, pass)) = credentials(entry) {
                http = http.with_credentials(user, pass);
            }
            if let Some(timeout) = timeout {
                http = http.with_timeout(timeout);
            }
            Arc::new(http)
        }
        "socks5" => {
            let server = require_server(&id, entry)?;
            let mut socks = Socks5AdapterFactory::new(id, server, Arc::clone(sockets));
            if let Some((user, pass)) = credentials(entry) {
                socks = socks.with_auth(user, pass);
            }
            if let Some(timeout) = timeout {
                socks = socks.with_timeout(timeout);
            }
            Arc::new(socks)
        }
        _ => {
            return Err(ConfigError::UnknownAdapterType {
                id,
                kind: kind.to_string(),
            })
        }
    };
    Ok(adapter)
}

fn require_server(id: &str, entry: &AdapterConfig) -> Result<std::net::SocketAddr, ConfigError> {
    entry
        .server
        .ok_or_else(|| ConfigError::validation(format!("Adapter '{id}' requires a server address")))
}

fn credentials(entry: &AdapterConfig) -> Option<(&str, &str)> {
    entry
        .username
        .as_deref()
        .map(|user| (user, entry.password.as_deref().unwrap_or("")))
}

/// Build every rule entry against `adapters`
///
/// # Errors
///
/// `MissingRuleType`, `UnknownRuleType`, `UnknownAdapterReference`,
/// `InvalidIpRange`, or `ValidationError` for a bad field.
pub fn build_rules(entries: &[RuleConfig], adapters: &AdapterRegistry) -> Result<RuleSet, ConfigError> {
    let rules = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| build_rule(index, entry, adapters))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RuleSet::new(rules))
}

fn build_rule(index: usize, entry: &RuleConfig, adapters: &AdapterRegistry) -> Result<Rule, ConfigError> {
    let Some(rule_type) = entry.rule_type.as_deref() else {
        return Err(ConfigError::MissingRuleType { index });
    };

    let kind = match rule_type.to_ascii_lowercase().as_str() {
        "all" => RuleKind::All,
        "dnsfail" => RuleKind::DnsFail,
        "iprange" => {
            if entry.ranges.is_empty() {
                return Err(ConfigError::validation(format!("Rule #{index} has no ranges")));
            }
            RuleKind::IpRangeList(IpRangeSet::parse(&entry.ranges)?)
        }
        "domainlist" => {
            let mut builder = DomainSet::builder();
            for domain in &entry.domains {
                builder = builder.add_exact(domain);
            }
            for suffix in &entry.suffixes {
                builder = builder.add_suffix(suffix);
            }
            for keyword in &entry.keywords {
                builder = builder.add_keyword(keyword);
            }
            for pattern in &entry.regexes {
                builder = builder.add_regex(pattern.clone());
            }
            let set = builder.build()?;
            if set.is_empty() {
                return Err(ConfigError::validation(format!("Rule #{index} has no domains")));
            }
            RuleKind::DomainList(set)
        }
        _ => {
            return Err(ConfigError::UnknownRuleType {
                index,
                kind: rule_type.to_string(),
            })
        }
    };

    let id = entry.adapter.as_deref().unwrap_or_default();
    let adapter = adapters.get(id).ok_or_else(|| ConfigError::UnknownAdapterReference {
        index,
        id: id.to_string(),
    })?;

    let rule = Rule::new(kind, adapter);
    Ok(match &entry.description {
        Some(description) => rule.with_description(description.clone()),
        None => rule,
    })
}
