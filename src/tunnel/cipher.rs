//! Tunnel cipher abstraction
//!
//! The interception layer treats WireGuard as an opaque encapsulate /
//! decapsulate service. [`TunnelCipher`] is that seam; [`BoringtunCipher`]
//! implements it with boringtun's `Tunn`.
//!
//! # Decapsulation flushing
//!
//! When boringtun answers a datagram with `WriteToNetwork` (handshake
//! response, cookie reply), it may also have queued transport packets that
//! were waiting on the handshake. Those are drained by calling `decapsulate`
//! again with an empty datagram until it reports `Done`.

use boringtun::noise::{Tunn, TunnResult};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::config::WgTunnelConfig;
use super::keys::{decode_preshared_key, decode_private_key, decode_public_key};
use crate::error::InterceptError;

/// `WireGuard` transport data packet overhead
///
/// - 4 bytes: message type
/// - 4 bytes: receiver index
/// - 8 bytes: counter
/// - 16 bytes: Poly1305 authentication tag
pub const WG_TRANSPORT_OVERHEAD: usize = 32;

/// `WireGuard` handshake initiation packet size (largest message type)
pub const WG_HANDSHAKE_INIT_SIZE: usize = 148;

/// Receive buffer size for datagrams from the tunnel endpoint
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Result of decapsulating one datagram from the endpoint
#[derive(Debug, Default)]
pub struct Decapsulated {
    /// Cleartext IP packets for the local side
    pub packets: Vec<Vec<u8>>,
    /// Datagrams that must go back to the endpoint (handshake traffic)
    pub to_network: Vec<Vec<u8>>,
}

/// Encapsulation service consumed by the tunnel session
pub trait TunnelCipher: Send + Sync {
    /// Encrypt one cleartext IP packet
    ///
    /// Returns `Ok(None)` when the packet was queued behind a pending
    /// handshake; the handshake initiation is then returned by the next
    /// [`TunnelCipher::update_timers`] call or was already sent.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::TunnelEncapsulation` if the cipher rejects the packet.
    fn encapsulate(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, InterceptError>;

    /// Decrypt one datagram received from the endpoint
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::TunnelDecapsulation` on authentication failure.
    fn decapsulate(&self, datagram: &[u8]) -> Result<Decapsulated, InterceptError>;

    /// Drive protocol timers (keepalive, rekey, handshake retry)
    fn update_timers(&self) -> Vec<Vec<u8>>;

    /// Datagram that starts a handshake, if the protocol wants one up front
    fn initiate(&self) -> Option<Vec<u8>> {
        None
    }
}

/// boringtun-backed WireGuard cipher
pub struct BoringtunCipher {
    tunn: Mutex<Box<Tunn>>,
    mtu: usize,
}

impl BoringtunCipher {
    /// Create a cipher from tunnel configuration
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Key` for malformed keys and
    /// `InterceptError::TunnelUnavailable` if boringtun refuses the parameters.
    pub fn new(config: &WgTunnelConfig, index: u32) -> Result<Self, InterceptError> {
        let static_private = decode_private_key(&config.private_key)?;
        let peer_public = decode_public_key(&config.peer_public_key)?;
        let preshared = config
            .preshared_key
            .as_deref()
            .map(decode_preshared_key)
            .transpose()?;

        let tunn = Tunn::new(
            static_private,
            peer_public,
            preshared,
            config.persistent_keepalive,
            index,
            None, // No rate limiter
        )
        .map_err(|e| InterceptError::TunnelUnavailable(format!("Failed to create tunnel: {e}")))?;

        debug!(
            "WireGuard cipher created: index={}, keepalive={:?}",
            index, config.persistent_keepalive
        );

        Ok(Self {
            tunn: Mutex::new(Box::new(tunn)),
            mtu: usize::from(config.mtu),
        })
    }

    fn scratch(&self, len: usize) -> Vec<u8> {
        // Must fit a handshake message boringtun may emit instead of data
        vec![0u8; (len + WG_TRANSPORT_OVERHEAD).max(WG_HANDSHAKE_INIT_SIZE)]
    }
}

impl TunnelCipher for BoringtunCipher {
    fn encapsulate(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, InterceptError> {
        let mut dst = self.scratch(packet.len());
        let mut tunn = self.tunn.lock();
        match tunn.encapsulate(packet, &mut dst) {
            TunnResult::WriteToNetwork(encrypted) => Ok(Some(encrypted.to_vec())),
            TunnResult::Done => {
                trace!("Packet queued until handshake completes");
                Ok(None)
            }
            TunnResult::Err(e) => Err(InterceptError::TunnelEncapsulation(format!("{e:?}"))),
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => Err(
                InterceptError::TunnelEncapsulation("Unexpected encapsulation result".into()),
            ),
        }
    }

    fn decapsulate(&self, datagram: &[u8]) -> Result<Decapsulated, InterceptError> {
        let mut out = Decapsulated::default();
        let mut dst = self.scratch(datagram.len().max(self.mtu));
        let mut tunn = self.tunn.lock();

        match tunn.decapsulate(None, datagram, &mut dst) {
            TunnResult::WriteToNetwork(reply) => {
                out.to_network.push(reply.to_vec());
                // Flush transport packets queued during the handshake
                loop {
                    match tunn.decapsulate(None, &[], &mut dst) {
                        TunnResult::WriteToNetwork(queued) => out.to_network.push(queued.to_vec()),
                        _ => break,
                    }
                }
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                out.packets.push(packet.to_vec());
            }
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                return Err(InterceptError::TunnelDecapsulation(format!("{e:?}")));
            }
        }

        Ok(out)
    }

    fn update_timers(&self) -> Vec<Vec<u8>> {
        let mut dst = vec![0u8; WG_HANDSHAKE_INIT_SIZE.max(WG_TRANSPORT_OVERHEAD * 2)];
        let mut tunn = self.tunn.lock();
        match tunn.update_timers(&mut dst) {
            TunnResult::WriteToNetwork(packet) => vec![packet.to_vec()],
            TunnResult::Err(e) => {
                trace!("WireGuard timer: {:?}", e);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn initiate(&self) -> Option<Vec<u8>> {
        let mut dst = vec![0u8; WG_HANDSHAKE_INIT_SIZE];
        let mut tunn = self.tunn.lock();
        match tunn.format_handshake_initiation(&mut dst, false) {
            TunnResult::WriteToNetwork(packet) => Some(packet.to_vec()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for BoringtunCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoringtunCipher").field("mtu", &self.mtu).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::keys::{derive_public_key, generate_private_key};

    fn pair() -> (BoringtunCipher, BoringtunCipher) {
        let client_key = generate_private_key();
        let server_key = generate_private_key();
        let client = WgTunnelConfig::new(
            client_key.clone(),
            derive_public_key(&server_key).unwrap(),
            "127.0.0.1:51820".into(),
        );
        let server = WgTunnelConfig::new(
            server_key,
            derive_public_key(&client_key).unwrap(),
            "127.0.0.1:51821".into(),
        );
        (
            BoringtunCipher::new(&client, 1).unwrap(),
            BoringtunCipher::new(&server, 2).unwrap(),
        )
    }

    #[test]
    fn test_rejects_bad_key() {
        let config = WgTunnelConfig::new("bad".into(), "bad".into(), "127.0.0.1:1".into());
        assert!(matches!(BoringtunCipher::new(&config, 0), Err(InterceptError::Key(_))));
    }

    #[test]
    fn test_initiate_produces_handshake() {
        let (client, _) = pair();
        let init = client.initiate().unwrap();
        assert_eq!(init.len(), WG_HANDSHAKE_INIT_SIZE);
    }

    #[test]
    fn test_garbage_fails_decapsulation() {
        let (client, _) = pair();
        let result = client.decapsulate(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]);
        assert!(matches!(result, Err(InterceptError::TunnelDecapsulation(_))));
    }

    #[test]
    fn test_handshake_then_transport() {
        let (client, server) = pair();

        let init = client.initiate().unwrap();
        let response = server.decapsulate(&init).unwrap();
        assert_eq!(response.to_network.len(), 1);

        // Client completes the handshake; keepalive may or may not follow
        let finished = client.decapsulate(&response.to_network[0]).unwrap();
        for datagram in &finished.to_network {
            let _ = server.decapsulate(datagram).unwrap();
        }

        // Minimal IPv4 header so boringtun accepts the cleartext
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[9] = 17;
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 1]);

        let encrypted = client.encapsulate(&packet).unwrap().unwrap();
        assert_eq!(encrypted.len(), packet.len().div_ceil(16) * 16 + WG_TRANSPORT_OVERHEAD);
        let decrypted = server.decapsulate(&encrypted).unwrap();
        assert_eq!(decrypted.packets, vec![packet]);
    }
}
