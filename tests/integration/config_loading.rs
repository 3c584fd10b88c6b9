//! Configuration integration tests
//!
//! Configuration files are written to disk, loaded, compiled and then
//! exercised through the rule engine.

use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use intercept_proxy::adapter::AdapterKind;
use intercept_proxy::config::{load_config, Configuration};
use intercept_proxy::error::ConfigError;
use intercept_proxy::rules::RuleEngine;
use intercept_proxy::session::{ConnectSession, HostResolver};

use super::kernel_sockets;

const SAMPLE: &str = r#"{
    "proxy": { "listen_addr": "127.0.0.1", "port": 0 },
    "dns": {
        "enabled": true,
        "listen": "127.0.0.1:0",
        "fake_ip": { "ipv4_pool": "198.18.0.0/16", "ttl_secs": 120 }
    },
    "adapters": [
        { "id": "direct", "type": "direct", "socket": "kernel" },
        { "id": "block", "type": "reject" },
        { "id": "corp", "type": "http", "server": "127.0.0.1:3128", "username": "u", "password": "p" }
    ],
    "rules": [
        { "type": "iprange", "adapter": "block", "ranges": ["10.0.0.0/8", "192.168.1.1+20"],
          "description": "private" },
        { "type": "domainlist", "adapter": "corp", "suffixes": ["corp.example"], "keywords": ["intranet"] },
        { "type": "all", "adapter": "direct", "description": "catch-all" }
    ],
    "log": { "level": "debug", "format": "json" }
}"#;

/// Resolver placing every name on the public internet
struct PublicResolver;

#[async_trait]
impl HostResolver for PublicResolver {
    async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        Ok(vec!["203.0.113.10".parse().unwrap()])
    }
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn compile(contents: &str) -> Result<Configuration, ConfigError> {
    let file = write_config(contents);
    let config = load_config(file.path())?;
    Configuration::compile(config, &kernel_sockets(), 1)
}

fn session(host: &str) -> ConnectSession {
    ConnectSession::new(host, 443, false, None).unwrap()
}

#[tokio::test]
async fn test_sample_config_routes_by_rule_order() {
    let compiled = compile(SAMPLE).unwrap();
    assert_eq!(compiled.adapters.len(), 3);
    assert_eq!(compiled.rules.len(), 3);
    assert!(compiled.settings.dns.enabled);
    assert_eq!(compiled.adapters.get("corp").unwrap().kind(), AdapterKind::Http);

    let engine = RuleEngine::with_resolver(compiled.rules, Arc::new(PublicResolver));
    let route = |host: &'static str| {
        let engine = &engine;
        async move { engine.evaluate(&session(host)).await.map(|a| a.id().to_string()) }
    };

    assert_eq!(route("10.20.30.40").await.as_deref(), Some("block"));
    assert_eq!(route("192.168.1.7").await.as_deref(), Some("block"));
    assert_eq!(route("192.168.1.21").await.as_deref(), Some("direct"));
    assert_eq!(route("git.corp.example").await.as_deref(), Some("corp"));
    assert_eq!(route("intranet-portal.example").await.as_deref(), Some("corp"));
    assert_eq!(route("8.8.8.8").await.as_deref(), Some("direct"));
}

#[test]
fn test_unknown_adapter_reference_is_reported() {
    let json = r#"{
        "adapters": [{ "id": "direct", "type": "direct" }],
        "rules": [
            { "type": "all", "adapter": "direct" },
            { "type": "all", "adapter": "missing" }
        ]
    }"#;
    let err = compile(json).err().unwrap();
    assert!(matches!(err, ConfigError::UnknownAdapterReference { index: 1, ref id } if id == "missing"));
}

#[test]
fn test_bad_range_and_types_are_reported() {
    let bad_range = r#"{
        "adapters": [{ "id": "direct", "type": "direct" }],
        "rules": [{ "type": "iprange", "adapter": "direct", "ranges": ["10.0.0.0/40"] }]
    }"#;
    assert!(matches!(compile(bad_range), Err(ConfigError::InvalidIpRange { .. })));

    let bad_rule = r#"{
        "adapters": [{ "id": "direct", "type": "direct" }],
        "rules": [{ "type": "geoip", "adapter": "direct" }]
    }"#;
    assert!(matches!(
        compile(bad_rule),
        Err(ConfigError::UnknownRuleType { index: 0, ref kind }) if kind == "geoip"
    ));

    let bad_adapter = r#"{
        "adapters": [{ "id": "tor", "type": "onion" }],
        "rules": []
    }"#;
    assert!(matches!(compile(bad_adapter), Err(ConfigError::UnknownAdapterType { .. })));
}

#[test]
fn test_missing_file_and_invalid_json() {
    assert!(matches!(
        load_config("/nonexistent/intercept-proxy.json"),
        Err(ConfigError::FileNotFound { .. })
    ));
    let file = write_config("{ not json");
    assert!(matches!(load_config(file.path()), Err(ConfigError::InvalidFile(_))));
}

#[tokio::test]
async fn test_reload_swaps_rules_atomically() {
    let first = compile(SAMPLE).unwrap();
    let engine = Arc::new(RuleEngine::new(first.rules));
    assert_eq!(engine.version(), 1);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let adapter = engine.evaluate(&session("10.0.0.1")).await;
                    let id = adapter.map(|a| a.id().to_string());
                    assert!(matches!(id.as_deref(), Some("block" | "direct")), "got {id:?}");
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    // Same file without the private-range rule.
    let relaxed = SAMPLE.replacen("\"adapter\": \"block\"", "\"adapter\": \"direct\"", 1);
    for version in 2..20 {
        let source = if version % 2 == 0 { relaxed.as_str() } else { SAMPLE };
        let file = write_config(source);
        let compiled = Configuration::compile(load_config(file.path()).unwrap(), &kernel_sockets(), version).unwrap();
        engine.reload(compiled.rules);
        tokio::task::yield_now().await;
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(engine.version(), 19);
    let last = engine.evaluate(&session("10.0.0.1")).await.unwrap();
    assert_eq!(last.id(), "block");
}
