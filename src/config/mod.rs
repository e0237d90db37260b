//! Configuration module for wg-intercept
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use wg_intercept::config::load_config;
//!
//! let config = load_config("/etc/wg-intercept/config.json").unwrap();
//! println!("Tunnel peer: {}", config.routing.server_ip);
//! ```

mod loader;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use types::{Config, LogConfig, RoutingConfig, UdpConfig, VirtualTcpConfig};
