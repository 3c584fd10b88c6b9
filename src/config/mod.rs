//! Configuration module for intercept-proxy
//!
//! This module provides configuration types, loading utilities and the
//! compile step that builds adapters and rules from them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intercept_proxy::config::{load_config, Configuration};
//! use intercept_proxy::socket::RawSocketFactory;
//!
//! let config = load_config("/etc/intercept-proxy/config.json").unwrap();
//! let compiled = Configuration::compile(config, &Arc::new(RawSocketFactory::new()), 1).unwrap();
//! println!("{} rules", compiled.rules.len());
//! ```

mod compile;
mod loader;
mod types;

pub use compile::{build_adapters, build_rules, Configuration};
pub use loader::{
    apply_env_overrides, load_config, load_config_str, load_config_with_env, ENV_LOG_LEVEL, ENV_PORT,
};
pub use types::{AdapterConfig, Config, DnsConfig, LogConfig, LogFormat, ProxyConfig, RuleConfig};
