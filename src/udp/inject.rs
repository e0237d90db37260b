//! Loopback injection and source rewriting
//!
//! Sockets the layer did not create receive tunnel data through the OS: the
//! injector writes each decapsulated payload from a loopback socket to the
//! target's loopback port. The OS then reports the injector as the source,
//! which `recvfrom` rewrites back to the handle's peer address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::classifier::canonical_ip;

/// Lazily bound loopback sockets, one per address family
#[derive(Debug, Default)]
pub struct Injector {
    v4: Mutex<Option<UdpSocket>>,
    v6: Mutex<Option<UdpSocket>>,
}

impl Injector {
    /// Create an injector; sockets are bound on first use
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopback destination for a socket bound to `local`
    #[must_use]
    pub fn target_for(local: SocketAddr) -> SocketAddr {
        match local {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()),
            SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
            }
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port()),
        }
    }

    fn slot(&self, family_v4: bool) -> &Mutex<Option<UdpSocket>> {
        if family_v4 {
            &self.v4
        } else {
            &self.v6
        }
    }

    /// Write `payload` to `target` from the loopback socket of its family
    ///
    /// # Errors
    ///
    /// Returns the OS error from binding or sending.
    pub fn inject(&self, target: SocketAddr, payload: &[u8]) -> io::Result<usize> {
        let mut slot = self.slot(target.is_ipv4()).lock();
        if slot.is_none() {
            let bind: SocketAddr = match target {
                SocketAddr::V4(_) => (Ipv4Addr::LOCALHOST, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::LOCALHOST, 0).into(),
            };
            let socket = UdpSocket::bind(bind)?;
            debug!("Inject socket bound to {:?}", socket.local_addr());
            *slot = Some(socket);
        }
        match slot.as_ref() {
            Some(socket) => socket.send_to(payload, target),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// Whether `reported` is the injector as seen by a receiving socket
    ///
    /// Dual-stack sockets see the IPv4 injector as `::ffff:127.0.0.1`.
    #[must_use]
    pub fn is_injected_source(&self, reported: &SocketAddr) -> bool {
        let ip = canonical_ip(reported.ip());
        if !ip.is_loopback() {
            return false;
        }
        let slot = self.slot(ip.is_ipv4()).lock();
        slot.as_ref()
            .and_then(|s| s.local_addr().ok())
            .is_some_and(|local| local.port() == reported.port())
    }

    /// Replace an injected source with the handle's peer address
    ///
    /// The peer is expressed in the family of the reported address so a
    /// dual-stack socket keeps seeing IPv6 addresses.
    #[must_use]
    pub fn rewrite_source(&self, reported: SocketAddr, peer: SocketAddr) -> SocketAddr {
        if !self.is_injected_source(&reported) {
            return reported;
        }
        match (reported, peer.ip()) {
            (SocketAddr::V6(_), IpAddr::V4(v4)) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), peer.port()),
            (SocketAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), peer.port()),
                None => {
                    warn!("Cannot express peer {} in IPv4, reporting it unchanged", peer);
                    peer
                }
            },
            _ => peer,
        }
    }
}
