//! Integration tests for wg-intercept
//!
//! Every test talks to a fake WireGuard peer on loopback. The peer and the
//! interceptor share an identity cipher, so the peer sees the cleartext IP
//! packets the layer builds and answers with packets of its own.
//!
//! # Test Organization
//!
//! - `common`: fake peer, identity cipher and config helpers
//! - `udp_tunnel`: connect/sendto/recvfrom over the UDP tunnel path
//! - `virtual_tcp`: stream transfer, reordering and close semantics
//! - `passthrough`: untracked handles behave as without the layer
//! - `config_files`: loading configuration from disk
//!
//! # Test Requirements
//!
//! - Loopback networking only; no privileges needed

pub mod common;
pub mod config_files;
pub mod passthrough;
pub mod udp_tunnel;
pub mod virtual_tcp;
