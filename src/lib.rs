//! wg-intercept: tunnel-aware socket interception over userspace WireGuard
//!
//! This crate sits between an application and its socket calls and carries
//! the traffic addressed to one tunnel peer through a WireGuard tunnel that
//! lives entirely in the process. Everything else passes through untouched.
//!
//! # Features
//!
//! - **UDP tunnel path**: datagrams to the peer are wrapped in IP/UDP and
//!   encapsulated; replies are delivered to a per-handle queue or injected
//!   over loopback with the source rewritten back to the peer
//! - **Virtual TCP**: stream sockets to the peer never connect for real; a
//!   minimal client TCP runs inside the tunnel instead
//! - **Lazy session**: one WireGuard session per context, started on the
//!   first tunneled call
//! - **C ABI**: `wg_*` functions with the libc signatures
//!
//! # Architecture
//!
//! ```text
//! app ──SocketApi──> Interceptor ──classify──> OsSockets (passthrough)
//!                        │
//!                        ├── UdpTunnelPath ──┐
//!                        └── VirtualTcp ─────┴──> TunnelSession ──UDP──> peer
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wg_intercept::config::load_config;
//! use wg_intercept::{ffi, Interceptor};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/wg-intercept/config.json")?;
//! let interceptor = Arc::new(Interceptor::from_config(config)?);
//! ffi::install(interceptor);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`classifier`]: Per-call routing decisions
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`ffi`]: C ABI
//! - [`interceptor`]: The tunnel-aware socket API
//! - [`packet`]: IPv4/IPv6 UDP and TCP packet building and parsing
//! - [`registry`]: Per-handle tunnel state
//! - [`socket`]: The socket call trait and its OS implementation
//! - [`tunnel`]: WireGuard cipher and session
//! - [`udp`]: UDP tunnel path
//! - [`vtcp`]: Virtual TCP transport

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod classifier;
pub mod config;
pub mod error;
pub mod ffi;
pub mod interceptor;
pub mod logging;
pub mod packet;
pub mod registry;
pub mod socket;
pub mod tunnel;
pub mod udp;
pub mod vtcp;

// Re-export commonly used types at the crate root
pub use classifier::{Classification, Classifier, TunnelPeer};
pub use config::{Config, LogConfig, RoutingConfig, UdpConfig, VirtualTcpConfig};
pub use error::{ConfigError, InterceptError};
pub use interceptor::{Interceptor, InterceptorStats};
pub use logging::init_logging;
pub use packet::PacketError;
pub use registry::{SocketEntry, SocketRegistry, TunnelMode};
pub use socket::{IoMode, MsgFlags, OsSockets, Protocol, Readiness, SocketApi, SocketHandle};
pub use tunnel::{BoringtunCipher, TunnelCipher, TunnelSession, WgTunnelConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
