//! UDP tunnel path
//!
//! Outbound datagrams are wrapped in an IP/UDP packet from the local tunnel
//! address and handed to the tunnel session. Inbound datagrams are routed by
//! their destination port (the sending socket's local port) to one of two
//! delivery mechanisms:
//!
//! - **Direct**: pushed onto the handle's [`DatagramQueue`], returned by the
//!   handle's next `recv`/`recvfrom`
//! - **Inject**: written to the socket's loopback port by the [`Injector`];
//!   `recvfrom` later rewrites the loopback source to the peer address
//!
//! Datagrams for a port nobody registered yet are held in a bounded pending
//! buffer and flushed when the port is registered. Servers commonly answer
//! before the application's first `sendto` has finished registering.

mod inject;
mod queue;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

pub use inject::Injector;
pub use queue::{DatagramQueue, InboundDatagram};

use crate::config::UdpConfig;
use crate::error::InterceptError;
use crate::packet::{build_udp_packet, parse_packet, PacketError, ParsedPacket, UdpView};
use crate::socket::SocketHandle;
use crate::tunnel::{PacketSink, TunnelCipher};

/// How inbound datagrams reach a handle
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Queue read by the interceptor's `recv`/`recvfrom`
    Queue(Arc<DatagramQueue>),
    /// Loopback address the real socket listens on
    Inject(SocketAddr),
}

/// Inbound route for one local port
#[derive(Debug, Clone)]
pub struct UdpRoute {
    pub handle: SocketHandle,
    pub delivery: Delivery,
}

#[derive(Debug, Default)]
struct UdpStats {
    tx_datagrams: AtomicU64,
    tx_bytes: AtomicU64,
    delivered_direct: AtomicU64,
    injected: AtomicU64,
    pending_buffered: AtomicU64,
    pending_flushed: AtomicU64,
    dropped: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UdpStatsSnapshot {
    pub tx_datagrams: u64,
    pub tx_bytes: u64,
    pub delivered_direct: u64,
    pub injected: u64,
    pub pending_buffered: u64,
    pub pending_flushed: u64,
    pub dropped: u64,
    pub routes: usize,
}

/// Encapsulation, routing and delivery of tunneled datagrams
#[derive(Debug)]
pub struct UdpTunnelPath {
    tunnel_ip: IpAddr,
    routes: DashMap<u16, UdpRoute>,
    pending: DashMap<u16, VecDeque<InboundDatagram>>,
    injector: Injector,
    config: UdpConfig,
    stats: UdpStats,
}

impl UdpTunnelPath {
    /// Create the path for a local tunnel address
    #[must_use]
    pub fn new(tunnel_ip: IpAddr, config: UdpConfig) -> Self {
        Self {
            tunnel_ip,
            routes: DashMap::new(),
            pending: DashMap::new(),
            injector: Injector::new(),
            config,
            stats: UdpStats::default(),
        }
    }

    /// Local address inside the tunnel
    #[must_use]
    pub const fn tunnel_ip(&self) -> IpAddr {
        self.tunnel_ip
    }

    /// New direct-delivery queue with the configured capacity
    #[must_use]
    pub fn new_queue(&self) -> Arc<DatagramQueue> {
        Arc::new(DatagramQueue::new(self.config.queue_capacity))
    }

    fn build(&self, local_port: u16, payload: &[u8], destination: SocketAddr) -> Result<Vec<u8>, InterceptError> {
        build_udp_packet(SocketAddr::new(self.tunnel_ip, local_port), destination, payload).map_err(|e| match e {
            PacketError::TooLarge { size, .. } => InterceptError::MessageTooLarge { size },
            PacketError::FamilyMismatch { .. } => InterceptError::TunnelUnavailable(e.to_string()),
        })
    }

    /// Encrypt one datagram for the tunnel
    ///
    /// Returns `None` when the cipher queued the packet behind a handshake.
    ///
    /// # Errors
    ///
    /// Returns `MessageTooLarge` for oversized payloads and the cipher's
    /// `TunnelEncapsulation` error otherwise.
    pub fn encapsulate(
        &self,
        cipher: &dyn TunnelCipher,
        local_port: u16,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        cipher.encapsulate(&self.build(local_port, payload, destination)?)
    }

    /// Decrypt a tunnel datagram into its UDP payloads and true sources
    ///
    /// Non-UDP packets are skipped.
    ///
    /// # Errors
    ///
    /// Returns `TunnelDecapsulation` if the datagram fails authentication.
    pub fn decapsulate(&self, cipher: &dyn TunnelCipher, datagram: &[u8]) -> Result<Vec<InboundDatagram>, InterceptError> {
        let decrypted = cipher.decapsulate(datagram)?;
        Ok(decrypted
            .packets
            .iter()
            .filter_map(|packet| match parse_packet(packet) {
                Some(ParsedPacket::Udp(view)) => Some(InboundDatagram {
                    source: view.src,
                    payload: Bytes::copy_from_slice(view.payload),
                }),
                _ => None,
            })
            .collect())
    }

    /// Send one datagram through the tunnel
    ///
    /// Returns the number of application bytes accepted, like `sendto`.
    ///
    /// # Errors
    ///
    /// Returns `MessageTooLarge`, `TunnelEncapsulation` or the session's
    /// write error. Nothing is retried here.
    pub fn send(
        &self,
        sink: &dyn PacketSink,
        local_port: u16,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<usize, InterceptError> {
        let packet = self.build(local_port, payload, destination)?;
        sink.transmit(&packet)?;

        trace!(
            "Tunneled {} bytes {}:{} -> {}",
            payload.len(),
            self.tunnel_ip,
            local_port,
            destination
        );
        self.stats.tx_datagrams.fetch_add(1, Ordering::Relaxed);
        self.stats.tx_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(payload.len())
    }

    /// Route inbound datagrams for `local_port` to a handle
    ///
    /// Any datagrams already pending for the port are delivered immediately.
    pub fn register(&self, local_port: u16, route: UdpRoute) {
        debug!(
            "UDP route registered: port {} -> {} ({})",
            local_port,
            route.handle,
            match route.delivery {
                Delivery::Queue(_) => "direct",
                Delivery::Inject(_) => "inject",
            }
        );
        self.routes.insert(local_port, route.clone());
        self.flush_pending(local_port, &route);
    }

    /// Remove the route for `local_port` if it still belongs to `handle`
    pub fn unregister(&self, local_port: u16, handle: SocketHandle) -> bool {
        let removed = self.routes.remove_if(&local_port, |_, route| route.handle == handle).is_some();
        if removed {
            debug!("UDP route removed: port {} ({})", local_port, handle);
        }
        removed
    }

    /// Current route for a port
    #[must_use]
    pub fn route(&self, local_port: u16) -> Option<UdpRoute> {
        self.routes.get(&local_port).map(|r| r.value().clone())
    }

    /// Deliver an inbound datagram to its handle
    pub fn deliver(&self, view: &UdpView<'_>) {
        let port = view.dst.port();
        let datagram = InboundDatagram {
            source: view.src,
            payload: Bytes::copy_from_slice(view.payload),
        };

        match self.route(port) {
            Some(route) => self.deliver_to(&route, datagram),
            None => self.buffer_pending(port, datagram),
        }
    }

    fn deliver_to(&self, route: &UdpRoute, datagram: InboundDatagram) {
        match &route.delivery {
            Delivery::Queue(queue) => {
                if queue.push(datagram) {
                    self.stats.delivered_direct.fetch_add(1, Ordering::Relaxed);
                } else {
                    trace!("Queue for {} closed, dropping datagram", route.handle);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Delivery::Inject(target) => match self.injector.inject(*target, &datagram.payload) {
                Ok(_) => {
                    self.stats.injected.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Inject to {} for {} failed: {}", target, route.handle, e);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    fn buffer_pending(&self, port: u16, datagram: InboundDatagram) {
        if !self.pending.contains_key(&port) && self.pending.len() >= self.config.max_pending_ports {
            trace!("Pending buffer full, dropping datagram for port {}", port);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut queue = self.pending.entry(port).or_default();
            if queue.len() >= self.config.pending_per_port {
                queue.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(datagram);
        }
        self.stats.pending_buffered.fetch_add(1, Ordering::Relaxed);
        trace!("Buffered datagram for unregistered port {}", port);

        // A registration may have raced with the buffering above
        if let Some(route) = self.route(port) {
            self.flush_pending(port, &route);
        }
    }

    fn flush_pending(&self, port: u16, route: &UdpRoute) {
        let Some((_, datagrams)) = self.pending.remove(&port) else {
            return;
        };
        debug!("Flushing {} pending datagrams to {}", datagrams.len(), route.handle);
        self.stats
            .pending_flushed
            .fetch_add(datagrams.len() as u64, Ordering::Relaxed);
        for datagram in datagrams {
            self.deliver_to(route, datagram);
        }
    }

    /// Replace an injected loopback source with the peer address
    #[must_use]
    pub fn rewrite_source(&self, reported: SocketAddr, peer: SocketAddr) -> SocketAddr {
        self.injector.rewrite_source(reported, peer)
    }

    /// Drop all routes and pending datagrams
    pub fn clear(&self) {
        self.routes.clear();
        self.pending.clear();
    }

    /// Get statistics snapshot
    #[must_use]
    pub fn stats(&self) -> UdpStatsSnapshot {
        UdpStatsSnapshot {
            tx_datagrams: self.stats.tx_datagrams.load(Ordering::Relaxed),
            tx_bytes: self.stats.tx_bytes.load(Ordering::Relaxed),
            delivered_direct: self.stats.delivered_direct.load(Ordering::Relaxed),
            injected: self.stats.injected.load(Ordering::Relaxed),
            pending_buffered: self.stats.pending_buffered.load(Ordering::Relaxed),
            pending_flushed: self.stats.pending_flushed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            routes: self.routes.len(),
        }
    }
}
