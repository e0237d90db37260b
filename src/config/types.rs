//! Configuration types for wg-intercept
//!
//! This module defines the configuration structures consumed by an
//! interception context. Configuration is loaded from JSON and validated
//! before the context is built.

use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tunnel::WgTunnelConfig;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// WireGuard keys and endpoint
    pub tunnel: WgTunnelConfig,

    /// Addresses inside the tunnel
    pub routing: RoutingConfig,

    /// UDP tunnel path tuning
    #[serde(default)]
    pub udp: UdpConfig,

    /// Virtual TCP tuning
    #[serde(default)]
    pub tcp: VirtualTcpConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Create a configuration with default tuning
    #[must_use]
    pub fn new(tunnel: WgTunnelConfig, routing: RoutingConfig) -> Self {
        Self {
            tunnel,
            routing,
            udp: UdpConfig::default(),
            tcp: VirtualTcpConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("tunnel: {e}")))?;
        self.routing.validate()?;
        self.udp.validate()?;
        self.tcp.validate()?;
        Ok(())
    }
}

/// Addressing inside the tunnel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// This client's address inside the tunnel (source of tunneled packets)
    pub tunnel_ip: IpAddr,

    /// The server's address as the application addresses it
    pub server_ip: IpAddr,

    /// Restrict the tunnel peer to one port; any port on `server_ip` when unset
    #[serde(default)]
    pub server_port: Option<u16>,
}

impl RoutingConfig {
    /// Create routing for a client/server address pair
    #[must_use]
    pub const fn new(tunnel_ip: IpAddr, server_ip: IpAddr) -> Self {
        Self {
            tunnel_ip,
            server_ip,
            server_port: None,
        }
    }

    /// Restrict the tunnel peer to a single port
    #[must_use]
    pub const fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    /// Validate the routing configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on family mismatch or
    /// unusable addresses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel_ip.is_ipv4() != self.server_ip.is_ipv4() {
            return Err(ConfigError::ValidationError(format!(
                "tunnel_ip {} and server_ip {} must be the same address family",
                self.tunnel_ip, self.server_ip
            )));
        }
        if self.tunnel_ip.is_unspecified() || self.server_ip.is_unspecified() {
            return Err(ConfigError::ValidationError(
                "tunnel_ip and server_ip must be specific addresses".into(),
            ));
        }
        if self.server_port == Some(0) {
            return Err(ConfigError::ValidationError(
                "server_port must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Local tunnel address for a port
    #[must_use]
    pub const fn local(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.tunnel_ip, port)
    }
}

/// UDP tunnel path configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Datagrams queued per direct-delivery handle before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Datagrams held per unregistered local port
    #[serde(default = "default_pending_per_port")]
    pub pending_per_port: usize,

    /// Distinct unregistered ports buffered at once
    #[serde(default = "default_pending_ports")]
    pub max_pending_ports: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            pending_per_port: default_pending_per_port(),
            max_pending_ports: default_pending_ports(),
        }
    }
}

impl UdpConfig {
    /// Validate the UDP configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "udp.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.pending_per_port == 0 {
            return Err(ConfigError::ValidationError(
                "udp.pending_per_port must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Virtual TCP configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirtualTcpConfig {
    /// Maximum segment size announced and used for data segments
    #[serde(default = "default_mss")]
    pub mss: u16,

    /// In-flight byte limit (further capped by the peer's window)
    #[serde(default = "default_window")]
    pub window: u32,

    /// Bytes buffered for sending before `send` blocks
    #[serde(default = "default_stream_buffer")]
    pub send_buffer: usize,

    /// Bytes buffered for the application (in order plus out of order)
    #[serde(default = "default_stream_buffer")]
    pub recv_buffer: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Initial retransmission timeout in milliseconds
    #[serde(default = "default_initial_rto_ms")]
    pub initial_rto_ms: u64,

    /// Upper bound for the backed-off retransmission timeout in milliseconds
    #[serde(default = "default_max_rto_ms")]
    pub max_rto_ms: u64,

    /// Retransmissions of one segment before the connection fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long a closed connection keeps draining, in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    /// First local port for virtual connections
    #[serde(default = "default_port_start")]
    pub port_range_start: u16,

    /// Last local port for virtual connections
    #[serde(default = "default_port_end")]
    pub port_range_end: u16,
}

impl Default for VirtualTcpConfig {
    fn default() -> Self {
        Self {
            mss: default_mss(),
            window: default_window(),
            send_buffer: default_stream_buffer(),
            recv_buffer: default_stream_buffer(),
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_rto_ms: default_initial_rto_ms(),
            max_rto_ms: default_max_rto_ms(),
            max_retries: default_max_retries(),
            linger_ms: default_linger_ms(),
            port_range_start: default_port_start(),
            port_range_end: default_port_end(),
        }
    }
}

impl VirtualTcpConfig {
    /// Validate the virtual TCP configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss < 64 {
            return Err(ConfigError::ValidationError("tcp.mss must be at least 64".into()));
        }
        if self.window == 0 {
            return Err(ConfigError::ValidationError(
                "tcp.window must be greater than 0".into(),
            ));
        }
        if self.send_buffer == 0 || self.recv_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "tcp buffers must be greater than 0".into(),
            ));
        }
        if self.initial_rto_ms == 0 || self.max_rto_ms < self.initial_rto_ms {
            return Err(ConfigError::ValidationError(
                "tcp.max_rto_ms must be >= tcp.initial_rto_ms > 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tcp.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ConfigError::ValidationError(format!(
                "tcp port range {}-{} is invalid",
                self.port_range_start, self.port_range_end
            )));
        }
        Ok(())
    }

    /// Connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Initial RTO as Duration
    #[must_use]
    pub const fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    /// Maximum RTO as Duration
    #[must_use]
    pub const fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    /// Linger time as Duration
    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Local port range
    #[must_use]
    pub const fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_pending_per_port() -> usize {
    512
}

const fn default_pending_ports() -> usize {
    64
}

const fn default_mss() -> u16 {
    // 1420 MTU - 40 IPv4/TCP - 20 headroom for IPv6
    1360
}

const fn default_window() -> u32 {
    65_535
}

const fn default_stream_buffer() -> usize {
    256 * 1024
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_initial_rto_ms() -> u64 {
    1_000
}

const fn default_max_rto_ms() -> u64 {
    30_000
}

const fn default_max_retries() -> u32 {
    8
}

const fn default_linger_ms() -> u64 {
    5_000
}

const fn default_port_start() -> u16 {
    49152
}

const fn default_port_end() -> u16 {
    65000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
