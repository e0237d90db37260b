//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: endpoint={}, tunnel_ip={}, server={}",
        config.tunnel.peer_endpoint, config.routing.tunnel_ip, config.routing.server_ip
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
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `WG_INTERCEPT_ENDPOINT`: Override the WireGuard endpoint
/// - `WG_INTERCEPT_SERVER_IP`: Override the server address inside the tunnel
/// - `WG_INTERCEPT_TUNNEL_IP`: Override this client's tunnel address
/// - `WG_INTERCEPT_LOG_LEVEL`: Override log level
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(endpoint) = lookup("WG_INTERCEPT_ENDPOINT") {
        config.tunnel.peer_endpoint = endpoint;
        debug!("Endpoint overridden to {}", config.tunnel.peer_endpoint);
    }

    if let Some(ip) = lookup("WG_INTERCEPT_SERVER_IP") {
        config.routing.server_ip = ip.parse().map_err(|_| ConfigError::EnvError {
            name: "WG_INTERCEPT_SERVER_IP".into(),
            reason: format!("Invalid IP address: {ip}"),
        })?;
        debug!("Server IP overridden to {}", config.routing.server_ip);
    }

    if let Some(ip) = lookup("WG_INTERCEPT_TUNNEL_IP") {
        config.routing.tunnel_ip = ip.parse().map_err(|_| ConfigError::EnvError {
            name: "WG_INTERCEPT_TUNNEL_IP".into(),
            reason: format!("Invalid IP address: {ip}"),
        })?;
        debug!("Tunnel IP overridden to {}", config.routing.tunnel_ip);
    }

    if let Some(level) = lookup("WG_INTERCEPT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    Ok(())
}
