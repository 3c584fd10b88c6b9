//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Overrides the proxy listen port
pub const ENV_PORT: &str = "INTERCEPT_PROXY_PORT";

/// Overrides the log level
pub const ENV_LOG_LEVEL: &str = "INTERCEPT_PROXY_LOG_LEVEL";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::InvalidFile(format!("{e} in {}", path.display())))?;

    config.validate()?;

    info!(
        "Configuration loaded: {} adapters, {} rules",
        config.adapters.len(),
        config.rules.len()
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidFile(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Apply environment variable overrides
///
/// Environment variables:
/// - `INTERCEPT_PROXY_PORT`: Override the proxy port
/// - `INTERCEPT_PROXY_LOG_LEVEL`: Override the log level
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for an unparseable value.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(port) = lookup(ENV_PORT) {
        config.proxy.port = port.trim().parse().map_err(|_| ConfigError::EnvError {
            name: ENV_PORT.into(),
            reason: format!("Invalid port: {port}"),
        })?;
        debug!("Proxy port overridden to {}", config.proxy.port);
    }

    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    Ok(())
}

/// Load configuration with environment variable overrides
///
/// # Errors
///
/// Returns `ConfigError` if loading, an override, or re-validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}
