//! Virtual TCP transport
//!
//! A minimal client-side TCP that runs inside the tunnel: the application's
//! stream socket never connects for real; its bytes travel as TCP segments
//! built here and encapsulated by the tunnel session.
//!
//! # Architecture
//!
//! ```text
//! app thread ──send/recv──> VirtualTcpConnection ──segments──> PacketSink
//!                               ^        ^
//!             wg-endpoint-rx ───┘        └─── wg-timer (retransmission)
//!             (dispatch by flow)
//! ```
//!
//! Connections live in the flow table from `open` until they are released
//! by their handle and fully closed (or their linger time has passed).

mod connection;
mod port_allocator;
mod reassembly;
mod tcb;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, trace};

pub use connection::{TcpFlow, VirtualTcpConnection};
pub use port_allocator::{PortAllocator, PortGuard, PORT_TIME_WAIT};
pub use reassembly::Reassembler;
pub use tcb::{seq_le, seq_lt, Segment, Tcb, TcpFailure, TcpState};

use crate::classifier::canonical_ip;
use crate::config::VirtualTcpConfig;
use crate::error::InterceptError;
use crate::packet::TcpView;
use crate::tunnel::PacketSink;

/// Flow table key: local port and canonical remote address
type FlowKey = (u16, SocketAddr);

fn flow_key(local_port: u16, remote: SocketAddr) -> FlowKey {
    (local_port, SocketAddr::new(canonical_ip(remote.ip()), remote.port()))
}

#[derive(Debug, Default)]
struct TransportStats {
    opened: AtomicU64,
    finished: AtomicU64,
    segments_in: AtomicU64,
    unmatched: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransportStatsSnapshot {
    pub opened: u64,
    pub finished: u64,
    pub segments_in: u64,
    pub unmatched: u64,
    pub active: usize,
}

/// Flow table of virtual TCP connections
#[derive(Debug)]
pub struct VirtualTcpTransport {
    tunnel_ip: IpAddr,
    config: VirtualTcpConfig,
    ports: Arc<PortAllocator>,
    flows: DashMap<FlowKey, Arc<VirtualTcpConnection>>,
    stats: TransportStats,
}

impl VirtualTcpTransport {
    /// Create a transport for a local tunnel address
    #[must_use]
    pub fn new(tunnel_ip: IpAddr, config: VirtualTcpConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(config.port_range(), PORT_TIME_WAIT));
        Self {
            tunnel_ip,
            config,
            ports,
            flows: DashMap::new(),
            stats: TransportStats::default(),
        }
    }

    /// Create a connection to `remote`; the caller drives `connect`
    ///
    /// # Errors
    ///
    /// - `PortsExhausted` if no local port is free
    /// - `TunnelUnavailable` if `remote` is not in the tunnel's family
    pub fn open(
        &self,
        remote: SocketAddr,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Arc<VirtualTcpConnection>, InterceptError> {
        if remote.is_ipv4() != self.tunnel_ip.is_ipv4() {
            return Err(InterceptError::TunnelUnavailable(format!(
                "{remote} is not reachable from tunnel address {}",
                self.tunnel_ip
            )));
        }

        let port = self.ports.allocate().ok_or(InterceptError::PortsExhausted)?;
        let flow = TcpFlow {
            local: SocketAddr::new(self.tunnel_ip, port.port()),
            remote,
        };
        let connection = Arc::new(VirtualTcpConnection::new(
            flow,
            rand::random(),
            &self.config,
            sink,
            port,
        ));

        self.flows
            .insert(flow_key(flow.local.port(), remote), Arc::clone(&connection));
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Virtual TCP flow opened: {}", flow);
        Ok(connection)
    }

    /// Route an inbound segment to its connection
    ///
    /// Returns `false` when no flow matches.
    pub fn dispatch(&self, segment: &TcpView<'_>) -> bool {
        self.stats.segments_in.fetch_add(1, Ordering::Relaxed);
        let connection = self
            .flows
            .get(&flow_key(segment.dst.port(), segment.src))
            .map(|c| Arc::clone(c.value()));

        match connection {
            Some(connection) => {
                connection.on_segment(segment);
                true
            }
            None => {
                trace!(
                    "No flow for segment {} -> {} [{}]",
                    segment.src,
                    segment.dst,
                    segment.flags
                );
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drive timers and forget finished connections
    pub fn tick(&self, now: Instant) {
        let connections: Vec<(FlowKey, Arc<VirtualTcpConnection>)> = self
            .flows
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (key, connection) in connections {
            if connection.poll(now) {
                self.flows.remove(&key);
                self.stats.finished.fetch_add(1, Ordering::Relaxed);
                debug!("Virtual TCP flow finished: {}", connection.flow());
            }
        }
    }

    /// Abort every connection
    pub fn shutdown(&self) {
        let connections: Vec<Arc<VirtualTcpConnection>> =
            self.flows.iter().map(|e| Arc::clone(e.value())).collect();
        if !connections.is_empty() {
            debug!("Aborting {} virtual TCP flows", connections.len());
        }
        for connection in connections {
            connection.abort();
        }
        self.flows.clear();
    }

    /// Number of flows in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the flow table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Get statistics snapshot
    #[must_use]
    pub fn stats(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            opened: self.stats.opened.load(Ordering::Relaxed),
            finished: self.stats.finished.load(Ordering::Relaxed),
            segments_in: self.stats.segments_in.load(Ordering::Relaxed),
            unmatched: self.stats.unmatched.load(Ordering::Relaxed),
            active: self.flows.len(),
        }
    }
}
