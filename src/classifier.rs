//! Tunnel classification
//!
//! Decides, per call, whether a socket's traffic belongs in the tunnel.
//! Classification only depends on the destination and the handle's current
//! registry entry, so the rules below are the whole state machine:
//!
//! | entry                     | protocol | destination  | result               |
//! |---------------------------|----------|--------------|----------------------|
//! | tunneled (any mode)       | any      | any          | entry's mode (sticky)|
//! | none / untracked          | UDP      | tunnel peer  | `AutoRegisterInject` |
//! | none / untracked          | UDP      | other / none | `Passthrough`        |
//! | none / untracked          | TCP      | any          | `Passthrough`        |

use std::net::{IpAddr, SocketAddr};

use tracing::trace;

use crate::config::RoutingConfig;
use crate::registry::{SocketEntry, TunnelMode};
use crate::socket::Protocol;

/// The tunnel peer as the application addresses it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelPeer {
    ip: IpAddr,
    port: Option<u16>,
}

impl TunnelPeer {
    /// Any port on `ip`
    #[must_use]
    pub const fn host(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }

    /// Exactly `addr`
    #[must_use]
    pub const fn exact(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: Some(addr.port()),
        }
    }

    /// Peer described by routing configuration
    #[must_use]
    pub const fn from_routing(routing: &RoutingConfig) -> Self {
        Self {
            ip: routing.server_ip,
            port: routing.server_port,
        }
    }

    /// Whether `addr` is the tunnel peer
    ///
    /// IPv4-mapped IPv6 destinations from dual-stack sockets match their
    /// IPv4 form.
    #[must_use]
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        canonical_ip(addr.ip()) == canonical_ip(self.ip) && self.port.map_or(true, |p| p == addr.port())
    }

    /// Peer address
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }
}

/// Strip the IPv4-mapped IPv6 form
#[must_use]
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

/// Where a call goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Real OS call with the original arguments
    Passthrough,
    /// Tunnel, handle already registered as connected to the peer
    TunnelDirect,
    /// Tunnel, handle registered (or to be registered) for inject delivery
    AutoRegisterInject,
}

impl Classification {
    /// Whether the call is tunneled
    #[must_use]
    pub const fn is_tunneled(self) -> bool {
        !matches!(self, Self::Passthrough)
    }
}

/// Socket/destination classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    peer: TunnelPeer,
}

impl Classifier {
    /// Create a classifier for one tunnel peer
    #[must_use]
    pub const fn new(peer: TunnelPeer) -> Self {
        Self { peer }
    }

    /// The configured tunnel peer
    #[must_use]
    pub const fn peer(&self) -> &TunnelPeer {
        &self.peer
    }

    /// Whether `addr` is the tunnel peer
    #[must_use]
    pub fn is_tunnel_peer(&self, addr: &SocketAddr) -> bool {
        self.peer.matches(addr)
    }

    /// Classify a call on a handle
    ///
    /// `destination` is the explicit address of a send-like call, `None` for
    /// `send`/`recv`-style calls.
    #[must_use]
    pub fn classify(
        &self,
        entry: Option<&SocketEntry>,
        protocol: Protocol,
        destination: Option<&SocketAddr>,
    ) -> Classification {
        // Sticky: a tunneled handle stays tunneled until it is closed
        if let Some(entry) = entry {
            match entry.mode {
                TunnelMode::TunnelDirect => return Classification::TunnelDirect,
                TunnelMode::InjectDelivery => return Classification::AutoRegisterInject,
                TunnelMode::Untracked => {}
            }
        }

        match (protocol, destination) {
            (Protocol::Udp, Some(dest)) if self.peer.matches(dest) => Classification::AutoRegisterInject,
            (Protocol::Udp, Some(_)) => Classification::Passthrough,
            (_, None) => {
                if entry.is_none() {
                    trace!("No classification for {} call without destination, passing through", protocol);
                }
                Classification::Passthrough
            }
            // TCP is only tracked through connect
            (Protocol::Tcp | Protocol::Other, Some(_)) => Classification::Passthrough,
        }
    }

    /// A peer destination expressed in the tunnel's address family
    #[must_use]
    pub fn normalize(&self, dest: SocketAddr) -> SocketAddr {
        normalize(dest, self.peer.ip)
    }

    /// Destination for a datagram on a tunneled handle
    ///
    /// A caller-provided peer address is kept (another port on the server);
    /// anything else goes to the handle's logical peer.
    #[must_use]
    pub fn tunnel_destination(&self, entry: &SocketEntry, requested: Option<SocketAddr>) -> Option<SocketAddr> {
        match requested {
            Some(dest) if self.peer.matches(&dest) => Some(normalize(dest, self.peer.ip)),
            Some(dest) => {
                trace!(
                    "Sticky {} redirects datagram for {} to {:?}",
                    entry.handle, dest, entry.peer_address
                );
                entry.peer_address
            }
            None => entry.peer_address,
        }
    }
}

/// Express a matched destination in the tunnel's address family
fn normalize(dest: SocketAddr, peer_ip: IpAddr) -> SocketAddr {
    SocketAddr::new(peer_ip, dest.port())
}
