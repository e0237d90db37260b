//! Socket registry
//!
//! Maps OS socket handles to their tunnel classification and per-socket
//! state. Every other component consults it; it depends on nothing but the
//! per-socket state objects it stores.
//!
//! # Thread Safety
//!
//! Uses `DashMap`, so lookups and updates on unrelated handles only contend
//! when they hash to the same shard. Lookups return a cloned snapshot; the
//! shared parts of an entry (inbound queue, virtual TCP connection, close
//! flag) are `Arc`s, so callers block on those without holding any map lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::socket::{Protocol, SocketHandle};
use crate::udp::DatagramQueue;
use crate::vtcp::VirtualTcpConnection;

/// Tunnel treatment of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelMode {
    /// Passed straight to the OS
    #[default]
    Untracked,
    /// Explicitly connected to the tunnel peer
    TunnelDirect,
    /// Auto-registered by `sendto`; receives through loopback injection
    InjectDelivery,
}

impl TunnelMode {
    /// Whether traffic on the handle goes through the tunnel
    #[must_use]
    pub const fn is_tunneled(self) -> bool {
        !matches!(self, Self::Untracked)
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Untracked => write!(f, "untracked"),
            Self::TunnelDirect => write!(f, "tunnel-direct"),
            Self::InjectDelivery => write!(f, "inject"),
        }
    }
}

/// Per-socket state
#[derive(Debug, Clone)]
pub struct SocketEntry {
    /// OS handle (registry key)
    pub handle: SocketHandle,
    /// Transport protocol
    pub protocol: Protocol,
    /// Tunnel treatment
    pub mode: TunnelMode,
    /// Remote endpoint the application believes it talks to
    pub peer_address: Option<SocketAddr>,
    /// Source port of tunneled packets (the socket's real local port for UDP)
    pub local_port: Option<u16>,
    /// Direct-delivery queue; `None` for inject delivery
    pub inbound: Option<Arc<DatagramQueue>>,
    /// Virtual TCP connection, TCP entries only
    pub tcp_state: Option<Arc<VirtualTcpConnection>>,
    /// Set once the handle is closed
    closed: Arc<AtomicBool>,
}

impl SocketEntry {
    /// Entry for a socket that is not tunneled
    #[must_use]
    pub fn untracked(handle: SocketHandle, protocol: Protocol) -> Self {
        Self {
            handle,
            protocol,
            mode: TunnelMode::Untracked,
            peer_address: None,
            local_port: None,
            inbound: None,
            tcp_state: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tunneled UDP entry; tunneled entries always carry a peer address
    #[must_use]
    pub fn udp(handle: SocketHandle, mode: TunnelMode, peer: SocketAddr, local_port: u16) -> Self {
        Self {
            mode,
            peer_address: Some(peer),
            local_port: Some(local_port),
            ..Self::untracked(handle, Protocol::Udp)
        }
    }

    /// Virtual TCP entry
    #[must_use]
    pub fn virtual_tcp(handle: SocketHandle, peer: SocketAddr, connection: Arc<VirtualTcpConnection>) -> Self {
        Self {
            mode: TunnelMode::TunnelDirect,
            peer_address: Some(peer),
            local_port: Some(connection.flow().local.port()),
            tcp_state: Some(connection),
            ..Self::untracked(handle, Protocol::Tcp)
        }
    }

    /// Attach a direct-delivery queue
    #[must_use]
    pub fn with_inbound(mut self, queue: Arc<DatagramQueue>) -> Self {
        self.inbound = Some(queue);
        self
    }

    /// Whether the handle was closed after this snapshot was taken
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the handle closed and wake anything blocked on its state
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(queue) = &self.inbound {
            queue.close();
        }
        if let Some(conn) = &self.tcp_state {
            conn.release();
        }
    }
}

/// Registry statistics
#[derive(Debug, Default)]
struct RegistryStats {
    /// Total entries inserted
    inserted: AtomicU64,
    /// Inserts that replaced a stale entry (handle reuse)
    replaced: AtomicU64,
    /// Total entries removed
    removed: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStatsSnapshot {
    pub inserted: u64,
    pub replaced: u64,
    pub removed: u64,
    pub active: usize,
}

/// Handle -> entry table
#[derive(Debug, Default)]
pub struct SocketRegistry {
    entries: DashMap<SocketHandle, SocketEntry>,
    stats: RegistryStats,
}

impl SocketRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entry for a handle
    #[must_use]
    pub fn lookup(&self, handle: SocketHandle) -> Option<SocketEntry> {
        self.entries.get(&handle).map(|e| e.value().clone())
    }

    /// Whether the handle has an entry
    #[must_use]
    pub fn contains(&self, handle: SocketHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Insert an entry, replacing any previous entry for the same handle
    ///
    /// A replaced entry is marked closed so anything still blocked on it
    /// wakes up. Returns the replaced entry.
    pub fn insert(&self, entry: SocketEntry) -> Option<SocketEntry> {
        debug_assert!(
            entry.protocol != Protocol::Udp || !entry.mode.is_tunneled() || entry.peer_address.is_some(),
            "tunneled UDP entry without peer address"
        );

        let handle = entry.handle;
        debug!(
            "Registering {} {} as {} (peer={:?})",
            entry.protocol, handle, entry.mode, entry.peer_address
        );

        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(handle, entry);
        if let Some(stale) = &previous {
            debug!("Replaced stale entry for {} ({})", handle, stale.mode);
            self.stats.replaced.fetch_add(1, Ordering::Relaxed);
            stale.mark_closed();
        }
        previous
    }

    /// Insert `entry` unless the handle already has one
    ///
    /// Returns the entry now in the table. Concurrent first calls on one
    /// handle agree on a single entry.
    pub fn get_or_insert(&self, entry: SocketEntry) -> SocketEntry {
        let handle = entry.handle;
        let current = self.entries.entry(handle).or_insert_with(|| {
            debug!(
                "Registering {} {} as {} (peer={:?})",
                entry.protocol, handle, entry.mode, entry.peer_address
            );
            self.stats.inserted.fetch_add(1, Ordering::Relaxed);
            entry
        });
        current.value().clone()
    }

    /// Remove the entry for a handle
    pub fn remove(&self, handle: SocketHandle) -> Option<SocketEntry> {
        let removed = self.entries.remove(&handle).map(|(_, entry)| entry);
        if removed.is_some() {
            trace!("Unregistered {}", handle);
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Mutate an entry in place
    ///
    /// Returns `false` if the handle has no entry.
    pub fn update(&self, handle: SocketHandle, mutation: impl FnOnce(&mut SocketEntry)) -> bool {
        match self.entries.get_mut(&handle) {
            Some(mut entry) => {
                mutation(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Number of registered handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered handles at the time of the call
    pub fn handles(&self) -> Vec<SocketHandle> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Remove every entry, returning them for teardown
    pub fn drain(&self) -> Vec<SocketEntry> {
        self.handles().into_iter().filter_map(|h| self.remove(h)).collect()
    }

    /// Remove every entry, waking anything blocked on them
    pub fn clear(&self) {
        for entry in self.drain() {
            entry.mark_closed();
        }
    }

    /// Get statistics snapshot
    #[must_use]
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            inserted: self.stats.inserted.load(Ordering::Relaxed),
            replaced: self.stats.replaced.load(Ordering::Relaxed),
            removed: self.stats.removed.load(Ordering::Relaxed),
            active: self.entries.len(),
        }
    }
}
