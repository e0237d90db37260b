//! Tunnel session
//!
//! Owns the real UDP socket to the WireGuard endpoint and the two background
//! threads that keep the tunnel alive:
//!
//! - `wg-endpoint-rx`: receives datagrams from the endpoint, decrypts them
//!   and hands every inner IP packet to the [`PacketHandler`]
//! - `wg-timer`: drives WireGuard timers (keepalive, rekey, handshake
//!   retransmission) and the handler's periodic work
//!
//! Writes to the endpoint socket are serialized by a lock that is held only
//! for the syscall itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ipnet::IpNet;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::cipher::{TunnelCipher, MAX_DATAGRAM_SIZE};
use super::config::WgTunnelConfig;
use crate::classifier::canonical_ip;
use crate::error::InterceptError;
use crate::packet::parse_packet;

/// WireGuard timer interval
const TIMER_TICK_MS: u64 = 250;

/// Handler tick interval (virtual TCP retransmission granularity)
const HANDLER_TICK_MS: u64 = 50;

/// Endpoint socket read timeout, bounds shutdown latency
const RECV_TIMEOUT_MS: u64 = 100;

/// Consumer of decrypted packets
pub trait PacketHandler: Send + Sync {
    /// Handle one decrypted IP packet from the tunnel
    fn handle_packet(&self, packet: &[u8]);

    /// Periodic work, called from the timer thread
    fn on_tick(&self, now: Instant);
}

/// Producer side of the tunnel: encrypts and sends one IP packet
pub trait PacketSink: Send + Sync {
    /// Send one IP packet through the tunnel
    ///
    /// # Errors
    ///
    /// Returns `TunnelEncapsulation` if the cipher fails, or the endpoint
    /// socket's error.
    fn transmit(&self, packet: &[u8]) -> Result<(), InterceptError>;
}

#[derive(Debug, Default)]
struct SessionStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    queued_packets: AtomicU64,
    invalid_packets: AtomicU64,
    decapsulation_errors: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionStatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub queued_packets: u64,
    pub invalid_packets: u64,
    pub decapsulation_errors: u64,
}

struct SessionShared {
    socket: UdpSocket,
    endpoint: SocketAddr,
    cipher: Arc<dyn TunnelCipher>,
    allowed_ips: Vec<IpNet>,
    running: AtomicBool,
    write_lock: Mutex<()>,
    stats: SessionStats,
}

impl SessionShared {
    fn write_raw(&self, datagram: &[u8]) -> std::io::Result<usize> {
        let _guard = self.write_lock.lock();
        self.socket.send_to(datagram, self.endpoint)
    }

    fn is_endpoint(&self, src: &SocketAddr) -> bool {
        src.port() == self.endpoint.port() && canonical_ip(src.ip()) == canonical_ip(self.endpoint.ip())
    }

    fn process_datagram(&self, datagram: &[u8], handler: &dyn PacketHandler) {
        let decrypted = match self.cipher.decapsulate(datagram) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", self.endpoint, e);
                self.stats.decapsulation_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for reply in &decrypted.to_network {
            if let Err(e) = self.write_raw(reply) {
                warn!("Failed to send handshake reply: {}", e);
            }
        }

        for packet in &decrypted.packets {
            let Some(src_ip) = parse_packet(packet).map(|p| p.source_ip()) else {
                debug!("Dropped undecodable packet ({} bytes)", packet.len());
                self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if !is_ip_allowed(src_ip, &self.allowed_ips) {
                warn!("Dropped packet from {} - not in allowed_ips", src_ip);
                self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.stats.rx_bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
            handler.handle_packet(packet);
        }
    }
}

/// A running tunnel to one WireGuard endpoint
pub struct TunnelSession {
    shared: Arc<SessionShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelSession {
    /// Open the endpoint socket, send the first handshake and start the
    /// background threads
    ///
    /// # Errors
    ///
    /// Returns `TunnelUnavailable` if the endpoint is invalid or the socket
    /// or threads cannot be created.
    pub fn start(
        config: &WgTunnelConfig,
        cipher: Arc<dyn TunnelCipher>,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Self, InterceptError> {
        let endpoint = config.endpoint().map_err(InterceptError::TunnelUnavailable)?;
        let allowed_ips = config.allowed_networks().map_err(InterceptError::TunnelUnavailable)?;
        let socket = open_endpoint_socket(config, endpoint)
            .map_err(|e| InterceptError::TunnelUnavailable(format!("endpoint socket: {e}")))?;

        info!(
            "Starting tunnel session to {} (local {:?})",
            endpoint,
            socket.local_addr().ok()
        );

        let shared = Arc::new(SessionShared {
            socket,
            endpoint,
            cipher,
            allowed_ips,
            running: AtomicBool::new(true),
            write_lock: Mutex::new(()),
            stats: SessionStats::default(),
        });

        if let Some(init) = shared.cipher.initiate() {
            match shared.write_raw(&init) {
                Ok(_) => debug!("Sent handshake initiation ({} bytes) to {}", init.len(), endpoint),
                Err(e) => warn!("Failed to send handshake initiation: {}", e),
            }
        }

        let session = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(2)),
        };

        let rx = {
            let shared = Arc::clone(&session.shared);
            let handler = Arc::clone(&handler);
            thread::Builder::new()
                .name("wg-endpoint-rx".into())
                .spawn(move || run_receiver(&shared, handler.as_ref()))
        };
        let timer = {
            let shared = Arc::clone(&session.shared);
            thread::Builder::new()
                .name("wg-timer".into())
                .spawn(move || run_timers(&shared, handler.as_ref()))
        };

        for spawned in [rx, timer] {
            match spawned {
                Ok(handle) => session.threads.lock().push(handle),
                Err(e) => {
                    session.shutdown();
                    return Err(InterceptError::TunnelUnavailable(format!("spawn: {e}")));
                }
            }
        }

        Ok(session)
    }

    /// Write one already-encrypted datagram to the endpoint
    ///
    /// # Errors
    ///
    /// Returns `TunnelUnavailable` after shutdown, otherwise the socket error.
    pub fn write_datagram(&self, datagram: &[u8]) -> Result<(), InterceptError> {
        if !self.is_running() {
            return Err(InterceptError::TunnelUnavailable("session shut down".into()));
        }
        self.shared.write_raw(datagram)?;
        Ok(())
    }

    /// The session's cipher
    #[must_use]
    pub fn cipher(&self) -> &dyn TunnelCipher {
        self.shared.cipher.as_ref()
    }

    /// WireGuard endpoint address
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.shared.endpoint
    }

    /// Local address of the endpoint socket
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.socket.local_addr().ok()
    }

    /// Whether the background threads are (still) running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the background threads and wait for them to exit
    ///
    /// Idempotent. Safe to call from one of the session's own threads.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("Stopping tunnel session to {}", self.shared.endpoint);
        }
        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Tunnel session thread panicked");
            }
        }
    }

    /// Get statistics snapshot
    #[must_use]
    pub fn stats(&self) -> SessionStatsSnapshot {
        let s = &self.shared.stats;
        SessionStatsSnapshot {
            tx_packets: s.tx_packets.load(Ordering::Relaxed),
            tx_bytes: s.tx_bytes.load(Ordering::Relaxed),
            rx_packets: s.rx_packets.load(Ordering::Relaxed),
            rx_bytes: s.rx_bytes.load(Ordering::Relaxed),
            queued_packets: s.queued_packets.load(Ordering::Relaxed),
            invalid_packets: s.invalid_packets.load(Ordering::Relaxed),
            decapsulation_errors: s.decapsulation_errors.load(Ordering::Relaxed),
        }
    }
}

impl PacketSink for TunnelSession {
    fn transmit(&self, packet: &[u8]) -> Result<(), InterceptError> {
        match self.shared.cipher.encapsulate(packet)? {
            Some(datagram) => {
                self.write_datagram(&datagram)?;
                self.shared.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .stats
                    .tx_bytes
                    .fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            None => {
                trace!("Packet ({} bytes) queued behind handshake", packet.len());
                self.shared.stats.queued_packets.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("endpoint", &self.shared.endpoint)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn open_endpoint_socket(config: &WgTunnelConfig, endpoint: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        warn!("Failed to set SO_RCVBUF: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        warn!("Failed to set SO_SNDBUF: {}", e);
    }

    let port = config.listen_port.unwrap_or(0);
    let bind: SocketAddr = match endpoint {
        SocketAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into(),
        SocketAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into(),
    };
    socket.bind(&bind.into())?;
    socket.set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))?;

    Ok(socket.into())
}

fn run_receiver(shared: &SessionShared, handler: &dyn PacketHandler) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while shared.running.load(Ordering::Acquire) {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                if !shared.is_endpoint(&src) {
                    warn!("Ignoring datagram from unexpected source {} (expected {})", src, shared.endpoint);
                    continue;
                }
                trace!("Endpoint recv: {} bytes", len);
                shared.process_datagram(&buf[..len], handler);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    warn!("Endpoint receive error: {}", e);
                    thread::sleep(Duration::from_millis(RECV_TIMEOUT_MS));
                }
            }
        }
    }

    debug!("Endpoint receiver exiting");
}

fn run_timers(shared: &SessionShared, handler: &dyn PacketHandler) {
    let timer_tick = Duration::from_millis(TIMER_TICK_MS);
    let mut last_timer = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(HANDLER_TICK_MS));
        let now = Instant::now();

        if now.duration_since(last_timer) >= timer_tick {
            last_timer = now;
            for datagram in shared.cipher.update_timers() {
                match shared.write_raw(&datagram) {
                    Ok(_) => trace!("Sent timer packet ({} bytes)", datagram.len()),
                    Err(e) => warn!("Failed to send timer packet: {}", e),
                }
            }
        }

        handler.on_tick(now);
    }

    debug!("Timer thread exiting");
}

/// Check if an IP is covered by `allowed_ips`; empty means allow all
fn is_ip_allowed(ip: IpAddr, allowed_ips: &[IpNet]) -> bool {
    if allowed_ips.is_empty() {
        return true;
    }
    let ip = canonical_ip(ip);
    allowed_ips.iter().any(|net| net.contains(&ip))
}
