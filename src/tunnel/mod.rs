//! WireGuard tunnel plumbing
//!
//! # Overview
//!
//! - [`config`]: tunnel configuration (keys, endpoint, allowed IPs)
//! - [`keys`]: key generation, derivation and validation
//! - [`cipher`]: the encryption seam, with a boringtun implementation
//! - [`session`]: the endpoint socket and its background threads
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use wg_intercept::tunnel::{
//!     derive_public_key, generate_private_key, BoringtunCipher, PacketHandler, TunnelSession,
//!     WgTunnelConfig,
//! };
//!
//! struct Print;
//!
//! impl PacketHandler for Print {
//!     fn handle_packet(&self, packet: &[u8]) {
//!         println!("{} bytes from the tunnel", packet.len());
//!     }
//!     fn on_tick(&self, _now: Instant) {}
//! }
//!
//! let private_key = generate_private_key();
//! let peer_key = derive_public_key(&generate_private_key())?;
//! let config = WgTunnelConfig::new(private_key, peer_key, "192.0.2.1:51820".into());
//!
//! let cipher = Arc::new(BoringtunCipher::new(&config, 1)?);
//! let session = TunnelSession::start(&config, cipher, Arc::new(Print))?;
//! session.shutdown();
//! # Ok::<(), wg_intercept::InterceptError>(())
//! ```

pub mod cipher;
pub mod config;
pub mod keys;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use cipher::{BoringtunCipher, Decapsulated, TunnelCipher, MAX_DATAGRAM_SIZE, WG_TRANSPORT_OVERHEAD};
pub use config::WgTunnelConfig;
pub use keys::{derive_public_key, generate_private_key, validate_key};
pub use session::{PacketHandler, PacketSink, SessionStatsSnapshot, TunnelSession};
