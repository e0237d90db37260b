//! WireGuard session configuration
//!
//! Keys, endpoint and socket tuning for the single tunnel session an
//! interception context owns.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::keys::validate_key;

/// Default socket receive buffer size for the session socket (208 KB)
pub const DEFAULT_SO_RCVBUF: usize = 212_992;

/// Default socket send buffer size for the session socket (208 KB)
pub const DEFAULT_SO_SNDBUF: usize = 212_992;

/// Default tunnel MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Configuration for the WireGuard tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgTunnelConfig {
    /// WireGuard private key (Base64 encoded)
    pub private_key: String,
    /// Peer public key (Base64 encoded)
    pub peer_public_key: String,
    /// Pre-shared key (Base64 encoded)
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Peer endpoint (IP:port)
    pub peer_endpoint: String,
    /// Source IPs accepted from the tunnel
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,
    /// Local UDP port for the session socket (0 = ephemeral)
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Persistent keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: Option<u16>,
    /// MTU for the tunnel
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// SO_RCVBUF for the session socket
    #[serde(default = "default_rcvbuf")]
    pub recv_buffer_size: usize,
    /// SO_SNDBUF for the session socket
    #[serde(default = "default_sndbuf")]
    pub send_buffer_size: usize,
}

impl Default for WgTunnelConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            peer_public_key: String::new(),
            preshared_key: None,
            peer_endpoint: String::new(),
            allowed_ips: default_allowed_ips(),
            listen_port: None,
            persistent_keepalive: default_keepalive(),
            mtu: DEFAULT_MTU,
            recv_buffer_size: DEFAULT_SO_RCVBUF,
            send_buffer_size: DEFAULT_SO_SNDBUF,
        }
    }
}

impl WgTunnelConfig {
    /// Create a new tunnel configuration
    ///
    /// # Arguments
    ///
    /// * `private_key` - Local WireGuard private key
    /// * `peer_public_key` - Remote peer's public key
    /// * `peer_endpoint` - Remote peer's endpoint (IP:port)
    #[must_use]
    pub fn new(private_key: String, peer_public_key: String, peer_endpoint: String) -> Self {
        Self {
            private_key,
            peer_public_key,
            peer_endpoint,
            ..Default::default()
        }
    }

    /// Set the allowed IPs
    #[must_use]
    pub fn with_allowed_ips(mut self, ips: Vec<String>) -> Self {
        self.allowed_ips = ips;
        self
    }

    /// Set the persistent keepalive
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    /// Set the MTU
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Parsed peer endpoint
    ///
    /// # Errors
    ///
    /// Returns a description if the endpoint is not `IP:port`.
    pub fn endpoint(&self) -> Result<SocketAddr, String> {
        self.peer_endpoint
            .parse()
            .map_err(|_| format!("Peer endpoint must be in IP:port format: {}", self.peer_endpoint))
    }

    /// Parsed allowed IP networks
    ///
    /// Bare addresses are accepted and treated as host routes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first entry that does not parse.
    pub fn allowed_networks(&self) -> Result<Vec<IpNet>, String> {
        self.allowed_ips
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .or_else(|_| s.parse::<std::net::IpAddr>().map(IpNet::from))
                    .map_err(|_| format!("Invalid allowed IP: {s}"))
            })
            .collect()
    }

    /// Validate the configuration
    ///
    /// # Returns
    ///
    /// Ok if valid, Err with description if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.private_key.is_empty() {
            return Err("Private key is required".into());
        }
        if self.peer_public_key.is_empty() {
            return Err("Peer public key is required".into());
        }
        if !validate_key(&self.private_key) {
            return Err("Private key must be 32 bytes of Base64".into());
        }
        if !validate_key(&self.peer_public_key) {
            return Err("Peer public key must be 32 bytes of Base64".into());
        }
        if let Some(psk) = &self.preshared_key {
            if !validate_key(psk) {
                return Err("Pre-shared key must be 32 bytes of Base64".into());
            }
        }

        self.endpoint()?;
        self.allowed_networks()?;

        // Minimum for IPv4 is 576
        if self.mtu < 576 {
            return Err("MTU must be at least 576".into());
        }

        Ok(())
    }
}

fn default_allowed_ips() -> Vec<String> {
    vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
}

#[allow(clippy::unnecessary_wraps)]
const fn default_keepalive() -> Option<u16> {
    Some(25)
}

const fn default_mtu() -> u16 {
    DEFAULT_MTU
}

const fn default_rcvbuf() -> usize {
    DEFAULT_SO_RCVBUF
}

const fn default_sndbuf() -> usize {
    DEFAULT_SO_SNDBUF
}
