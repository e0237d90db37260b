//! Interception context
//!
//! [`Interceptor`] is the tunnel-aware [`SocketApi`]: it owns the registry,
//! the classifier, both transports and the lazily started tunnel session,
//! and falls back to the wrapped passthrough implementation for everything
//! that does not belong in the tunnel.
//!
//! # Call routing
//!
//! | call       | tunneled UDP (inject)         | tunneled UDP (queue) | virtual TCP     | other  |
//! |------------|-------------------------------|----------------------|-----------------|--------|
//! | `connect`  | registry only, no real call   | registry only        | virtual connect | real   |
//! | `send*`    | UDP tunnel path               | UDP tunnel path      | stream write    | real   |
//! | `recv`     | real recv                     | queue pop            | stream read     | real   |
//! | `recvfrom` | real recvfrom + source rewrite| queue pop            | stream read     | real   |
//! | `close`    | unregister, wake, real close  | unregister, wake     | FIN, real close | real   |

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::classifier::{Classification, Classifier, TunnelPeer};
use crate::config::Config;
use crate::error::InterceptError;
use crate::packet::{parse_packet, ParsedPacket};
use crate::registry::{RegistryStatsSnapshot, SocketEntry, SocketRegistry, TunnelMode};
use crate::socket::{IoMode, MsgFlags, OsSockets, Protocol, Readiness, SocketApi, SocketHandle};
use crate::tunnel::{BoringtunCipher, PacketHandler, PacketSink, SessionStatsSnapshot, TunnelCipher, TunnelSession};
use crate::udp::{Delivery, Injector, UdpRoute, UdpStatsSnapshot, UdpTunnelPath};
use crate::vtcp::{TransportStatsSnapshot, VirtualTcpTransport};

/// Routes decrypted packets to the transports
struct Dispatcher {
    udp: Arc<UdpTunnelPath>,
    tcp: Arc<VirtualTcpTransport>,
}

impl PacketHandler for Dispatcher {
    fn handle_packet(&self, packet: &[u8]) {
        match parse_packet(packet) {
            Some(ParsedPacket::Udp(view)) => self.udp.deliver(&view),
            Some(ParsedPacket::Tcp(view)) => {
                self.tcp.dispatch(&view);
            }
            Some(ParsedPacket::Other { src, protocol }) => {
                trace!("Ignoring protocol {} packet from {}", protocol, src);
            }
            None => trace!("Ignoring malformed packet ({} bytes)", packet.len()),
        }
    }

    fn on_tick(&self, now: Instant) {
        self.tcp.tick(now);
    }
}

/// Statistics of every component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InterceptorStats {
    pub registry: RegistryStatsSnapshot,
    pub udp: UdpStatsSnapshot,
    pub tcp: TransportStatsSnapshot,
    pub session: Option<SessionStatsSnapshot>,
}

/// Tunnel-aware socket API
pub struct Interceptor<S: SocketApi = OsSockets> {
    os: S,
    config: Config,
    classifier: Classifier,
    registry: SocketRegistry,
    udp: Arc<UdpTunnelPath>,
    tcp: Arc<VirtualTcpTransport>,
    cipher: Arc<dyn TunnelCipher>,
    session: ArcSwapOption<TunnelSession>,
    session_init: Mutex<()>,
    shut_down: AtomicBool,
}

impl Interceptor<OsSockets> {
    /// Context over the real OS sockets with a boringtun cipher
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid configuration and `Key` for bad keys.
    pub fn from_config(config: Config) -> Result<Self, InterceptError> {
        config.validate()?;
        let cipher = Arc::new(BoringtunCipher::new(&config.tunnel, rand::random::<u32>() >> 8)?);
        Self::new(config, cipher, OsSockets::new())
    }
}

impl<S: SocketApi> Interceptor<S> {
    /// Build a context from its parts
    ///
    /// The tunnel session is not started until the first tunneled send.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration does not validate.
    pub fn new(config: Config, cipher: Arc<dyn TunnelCipher>, os: S) -> Result<Self, InterceptError> {
        config.validate()?;
        let tunnel_ip = config.routing.tunnel_ip;
        let peer = TunnelPeer::from_routing(&config.routing);

        info!(
            "Interception context: tunnel {} -> peer {}{} via {}",
            tunnel_ip,
            config.routing.server_ip,
            config
                .routing
                .server_port
                .map_or_else(String::new, |p| format!(":{p}")),
            config.tunnel.peer_endpoint
        );

        Ok(Self {
            os,
            classifier: Classifier::new(peer),
            registry: SocketRegistry::new(),
            udp: Arc::new(UdpTunnelPath::new(tunnel_ip, config.udp.clone())),
            tcp: Arc::new(VirtualTcpTransport::new(tunnel_ip, config.tcp.clone())),
            cipher,
            session: ArcSwapOption::empty(),
            session_init: Mutex::new(()),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// The wrapped passthrough implementation
    pub const fn os(&self) -> &S {
        &self.os
    }

    /// Socket registry
    pub const fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    /// Classifier
    pub const fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// The running tunnel session, if one was started
    pub fn session(&self) -> Option<Arc<TunnelSession>> {
        self.session.load_full()
    }

    /// Start the tunnel session on first use
    fn ensure_session(&self) -> Result<Arc<TunnelSession>, InterceptError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(InterceptError::TunnelUnavailable("interceptor shut down".into()));
        }
        if let Some(session) = self.session.load_full() {
            return Ok(session);
        }

        let _guard = self.session_init.lock();
        if let Some(session) = self.session.load_full() {
            return Ok(session);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(InterceptError::TunnelUnavailable("interceptor shut down".into()));
        }

        let handler = Arc::new(Dispatcher {
            udp: Arc::clone(&self.udp),
            tcp: Arc::clone(&self.tcp),
        });
        let session = Arc::new(TunnelSession::start(
            &self.config.tunnel,
            Arc::clone(&self.cipher),
            handler,
        )?);
        self.session.store(Some(Arc::clone(&session)));
        Ok(session)
    }

    /// Make sure the real socket has a local port and return its address
    fn ensure_bound(&self, handle: SocketHandle) -> io::Result<SocketAddr> {
        let current = self
            .os
            .local_addr(handle)?
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT))?;
        if current.port() != 0 {
            return Ok(current);
        }

        // Unbound: let the OS pick a port on the wildcard address
        self.os.bind(handle, SocketAddr::new(current.ip(), 0))?;
        let bound = self
            .os
            .local_addr(handle)?
            .filter(|a| a.port() != 0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EADDRNOTAVAIL))?;
        debug!("Bound {} to {} for tunnel traffic", handle, bound);
        Ok(bound)
    }

    fn register_inject(&self, handle: SocketHandle, local: SocketAddr) {
        self.udp.register(
            local.port(),
            UdpRoute {
                handle,
                delivery: Delivery::Inject(Injector::target_for(local)),
            },
        );
    }

    /// Register a UDP socket for direct queue delivery
    ///
    /// For sockets the owning code creates tunnel-aware: inbound datagrams
    /// are queued for `recv`/`recvfrom` instead of passing through the OS.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket cannot be bound.
    pub fn register_udp(&self, handle: SocketHandle, peer: SocketAddr) -> Result<(), InterceptError> {
        let peer = if self.classifier.is_tunnel_peer(&peer) {
            self.classifier.normalize(peer)
        } else {
            peer
        };
        let local = self.ensure_bound(handle)?;
        let queue = self.udp.new_queue();

        self.registry.insert(
            SocketEntry::udp(handle, TunnelMode::TunnelDirect, peer, local.port()).with_inbound(Arc::clone(&queue)),
        );
        self.udp.register(
            local.port(),
            UdpRoute {
                handle,
                delivery: Delivery::Queue(queue),
            },
        );
        Ok(())
    }

    /// Readiness of a tunneled handle; `None` means ask the OS
    pub fn readiness(&self, handle: SocketHandle) -> Option<Readiness> {
        let entry = self.registry.lookup(handle)?;
        if let Some(conn) = &entry.tcp_state {
            return Some(conn.readiness());
        }
        entry.inbound.as_ref().map(|queue| Readiness {
            readable: !queue.is_empty() || queue.is_closed(),
            writable: true,
            hangup: queue.is_closed(),
        })
    }

    /// Logical peer of a tunneled handle (for `getpeername`)
    pub fn peer_address(&self, handle: SocketHandle) -> Option<SocketAddr> {
        self.registry
            .lookup(handle)
            .filter(|e| e.mode.is_tunneled())
            .and_then(|e| e.peer_address)
    }

    fn connect_udp(&self, handle: SocketHandle, addr: SocketAddr) -> Result<(), InterceptError> {
        let peer = self.classifier.normalize(addr);
        let local = self.ensure_bound(handle)?;

        let updated = self.registry.update(handle, |entry| {
            entry.mode = TunnelMode::TunnelDirect;
            entry.peer_address = Some(peer);
            entry.local_port = Some(local.port());
        });
        if !updated {
            self.registry
                .insert(SocketEntry::udp(handle, TunnelMode::TunnelDirect, peer, local.port()));
        }
        if self.udp.route(local.port()).is_none() {
            self.register_inject(handle, local);
        }
        debug!("UDP {} connected to tunnel peer {} (local {})", handle, peer, local);
        Ok(())
    }

    fn connect_tcp(&self, handle: SocketHandle, addr: SocketAddr) -> Result<(), InterceptError> {
        let mode = self.os.io_mode(handle)?;
        if let Some(conn) = self.registry.lookup(handle).and_then(|e| e.tcp_state) {
            // Repeated connect on a non-blocking socket
            return conn.connect(mode);
        }

        let peer = self.classifier.normalize(addr);
        let session = self.ensure_session()?;
        let conn = self.tcp.open(peer, session as Arc<dyn PacketSink>)?;
        self.registry
            .insert(SocketEntry::virtual_tcp(handle, peer, Arc::clone(&conn)));
        conn.connect(mode)
    }

    fn auto_register(&self, handle: SocketHandle, dest: SocketAddr) -> Result<SocketEntry, InterceptError> {
        let peer = self.classifier.normalize(dest);
        let local = self.ensure_bound(handle)?;
        let entry = self
            .registry
            .get_or_insert(SocketEntry::udp(handle, TunnelMode::InjectDelivery, peer, local.port()));
        if self.udp.route(local.port()).is_none() {
            self.register_inject(handle, local);
        }
        Ok(entry)
    }

    fn tunnel_send_udp(
        &self,
        handle: SocketHandle,
        entry: Option<SocketEntry>,
        buf: &[u8],
        dest: Option<SocketAddr>,
    ) -> Result<usize, InterceptError> {
        let entry = match entry {
            Some(entry) if entry.mode.is_tunneled() => entry,
            _ => {
                let dest = dest.ok_or(InterceptError::NotConnected)?;
                self.auto_register(handle, dest)?
            }
        };
        let dest = self
            .classifier
            .tunnel_destination(&entry, dest)
            .ok_or(InterceptError::NotConnected)?;
        let local_port = entry.local_port.ok_or(InterceptError::NotConnected)?;

        let session = self.ensure_session()?;
        self.udp.send(session.as_ref(), local_port, buf, dest)
    }

    fn protocol_for(&self, handle: SocketHandle, entry: Option<&SocketEntry>, dest: Option<&SocketAddr>) -> io::Result<Protocol> {
        match entry {
            Some(entry) => Ok(entry.protocol),
            None if dest.is_some_and(|d| self.classifier.is_tunnel_peer(d)) => self.os.socket_type(handle),
            None => Ok(Protocol::Other),
        }
    }

    /// Tear the context down
    ///
    /// Wakes every blocked caller, aborts virtual TCP connections and stops
    /// the tunnel session. Application handles stay open; later calls on
    /// them pass through.
    pub fn teardown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down interception context ({} tracked handles)", self.registry.len());
        self.registry.clear();
        self.tcp.shutdown();
        self.udp.clear();

        let _guard = self.session_init.lock();
        if let Some(session) = self.session.swap(None) {
            session.shutdown();
        }
    }

    /// Get statistics of every component
    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            registry: self.registry.stats(),
            udp: self.udp.stats(),
            tcp: self.tcp.stats(),
            session: self.session.load().as_ref().map(|s| s.stats()),
        }
    }
}

impl<S: SocketApi> SocketApi for Interceptor<S> {
    fn connect(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        if !self.classifier.is_tunnel_peer(&addr) {
            return self.os.connect(handle, addr);
        }
        match self.os.socket_type(handle)? {
            Protocol::Udp => Ok(self.connect_udp(handle, addr)?),
            Protocol::Tcp => Ok(self.connect_tcp(handle, addr)?),
            Protocol::Other => self.os.connect(handle, addr),
        }
    }

    fn send(&self, handle: SocketHandle, buf: &[u8], flags: MsgFlags) -> io::Result<usize> {
        let Some(entry) = self.registry.lookup(handle).filter(|e| e.mode.is_tunneled()) else {
            trace!("Untracked send on {}, passing through", handle);
            return self.os.send(handle, buf, flags);
        };

        if let Some(conn) = &entry.tcp_state {
            let mode = self.os.io_mode(handle)?;
            return Ok(conn.send(buf, flags, mode)?);
        }
        if entry.protocol == Protocol::Udp {
            return Ok(self.tunnel_send_udp(handle, Some(entry), buf, None)?);
        }
        self.os.send(handle, buf, flags)
    }

    fn recv(&self, handle: SocketHandle, buf: &mut [u8], flags: MsgFlags) -> io::Result<usize> {
        let Some(entry) = self.registry.lookup(handle).filter(|e| e.mode.is_tunneled()) else {
            return self.os.recv(handle, buf, flags);
        };

        if let Some(conn) = &entry.tcp_state {
            let mode = self.os.io_mode(handle)?;
            return Ok(conn.recv(buf, flags, mode)?);
        }
        if let Some(queue) = &entry.inbound {
            let mode = self.os.io_mode(handle)?;
            let (n, _) = queue.pop(
                buf,
                flags.contains(MsgFlags::PEEK),
                mode.is_nonblocking(flags),
                mode.recv_timeout,
            )?;
            return Ok(n);
        }

        let result = self.os.recv(handle, buf, flags);
        if entry.is_closed() {
            return Err(InterceptError::SocketClosed.into());
        }
        result
    }

    fn send_to(
        &self,
        handle: SocketHandle,
        buf: &[u8],
        flags: MsgFlags,
        dest: Option<SocketAddr>,
    ) -> io::Result<usize> {
        let entry = self.registry.lookup(handle);
        let protocol = self.protocol_for(handle, entry.as_ref(), dest.as_ref())?;

        match self.classifier.classify(entry.as_ref(), protocol, dest.as_ref()) {
            Classification::Passthrough => self.os.send_to(handle, buf, flags, dest),
            Classification::TunnelDirect | Classification::AutoRegisterInject => {
                if let Some(conn) = entry.as_ref().and_then(|e| e.tcp_state.clone()) {
                    let mode = self.os.io_mode(handle)?;
                    return Ok(conn.send(buf, flags, mode)?);
                }
                Ok(self.tunnel_send_udp(handle, entry, buf, dest)?)
            }
        }
    }

    fn recv_from(
        &self,
        handle: SocketHandle,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> io::Result<(usize, Option<SocketAddr>)> {
        let Some(entry) = self.registry.lookup(handle).filter(|e| e.mode.is_tunneled()) else {
            return self.os.recv_from(handle, buf, flags);
        };

        if let Some(conn) = &entry.tcp_state {
            let mode = self.os.io_mode(handle)?;
            return Ok((conn.recv(buf, flags, mode)?, None));
        }
        if let Some(queue) = &entry.inbound {
            let mode = self.os.io_mode(handle)?;
            let (n, source) = queue.pop(
                buf,
                flags.contains(MsgFlags::PEEK),
                mode.is_nonblocking(flags),
                mode.recv_timeout,
            )?;
            return Ok((n, Some(source)));
        }

        let result = self.os.recv_from(handle, buf, flags);
        if entry.is_closed() {
            return Err(InterceptError::SocketClosed.into());
        }
        let (n, source) = result?;
        let source = match (source, entry.peer_address) {
            (Some(reported), Some(peer)) => Some(self.udp.rewrite_source(reported, peer)),
            (source, _) => source,
        };
        Ok((n, source))
    }

    fn close(&self, handle: SocketHandle) -> io::Result<()> {
        if let Some(entry) = self.registry.remove(handle) {
            debug!("Closing tracked {} {} ({})", entry.protocol, handle, entry.mode);
            if entry.protocol == Protocol::Udp {
                if let Some(port) = entry.local_port {
                    self.udp.unregister(port, handle);
                }
            }
            entry.mark_closed();

            // Threads blocked in the OS on an inject-delivery socket
            if entry.protocol == Protocol::Udp && entry.inbound.is_none() && entry.mode.is_tunneled() {
                if let Err(e) = self.os.shutdown(handle) {
                    trace!("shutdown({}) before close: {}", handle, e);
                }
            }
        }
        self.os.close(handle)
    }

    fn socket_type(&self, handle: SocketHandle) -> io::Result<Protocol> {
        match self.registry.lookup(handle) {
            Some(entry) => Ok(entry.protocol),
            None => self.os.socket_type(handle),
        }
    }

    fn local_addr(&self, handle: SocketHandle) -> io::Result<Option<SocketAddr>> {
        self.os.local_addr(handle)
    }

    fn bind(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        self.os.bind(handle, addr)
    }

    fn shutdown(&self, handle: SocketHandle) -> io::Result<()> {
        if let Some(conn) = self.registry.lookup(handle).and_then(|e| e.tcp_state) {
            conn.shutdown();
            return Ok(());
        }
        self.os.shutdown(handle)
    }

    fn io_mode(&self, handle: SocketHandle) -> io::Result<IoMode> {
        self.os.io_mode(handle)
    }
}

impl<S: SocketApi> Drop for Interceptor<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<S: SocketApi> std::fmt::Debug for Interceptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("classifier", &self.classifier)
            .field("registry", &self.registry.len())
            .field("session", &self.session.load().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::tunnel::testing::ClearCipher;
    use crate::tunnel::{derive_public_key, generate_private_key, WgTunnelConfig};
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    fn config() -> Config {
        let tunnel = WgTunnelConfig::new(
            generate_private_key(),
            derive_public_key(&generate_private_key()).unwrap(),
            "127.0.0.1:9".into(),
        );
        Config::new(
            tunnel,
            RoutingConfig::new("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap()),
        )
    }

    fn interceptor() -> Interceptor {
        Interceptor::new(config(), Arc::new(ClearCipher), OsSockets::new()).unwrap()
    }

    #[test]
    fn test_passthrough_untracked() {
        let icpt = interceptor();
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        b.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();

        let sent = icpt
            .send_to(SocketHandle(a.as_raw_fd()), b"plain", MsgFlags::NONE, b.local_addr().ok())
            .unwrap();
        assert_eq!(sent, 5);
        let mut buf = [0u8; 8];
        let (n, from) = icpt.recv_from(SocketHandle(b.as_raw_fd()), &mut buf, MsgFlags::NONE).unwrap();
        assert_eq!(&buf[..n], b"plain");
        assert_eq!(from, a.local_addr().ok());
        assert!(icpt.registry().is_empty());
        assert!(icpt.session().is_none());
    }

    #[test]
    fn test_udp_connect_to_peer_is_virtual() {
        let icpt = interceptor();
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        let handle = SocketHandle(socket.as_raw_fd());

        icpt.connect(handle, "10.0.0.1:47998".parse().unwrap()).unwrap();
        let entry = icpt.registry().lookup(handle).unwrap();
        assert_eq!(entry.mode, TunnelMode::TunnelDirect);
        assert_eq!(entry.peer_address, Some("10.0.0.1:47998".parse().unwrap()));
        assert_eq!(icpt.peer_address(handle), entry.peer_address);
        // No real connect happened
        assert!(socket.peer_addr().is_err());
    }

    #[test]
    fn test_sendto_peer_auto_registers() {
        let icpt = interceptor();
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        let handle = SocketHandle(socket.as_raw_fd());

        let n = icpt
            .send_to(handle, b"ping", MsgFlags::NONE, Some("10.0.0.1:47999".parse().unwrap()))
            .unwrap();
        assert_eq!(n, 4);
        let entry = icpt.registry().lookup(handle).unwrap();
        assert_eq!(entry.mode, TunnelMode::InjectDelivery);
        assert_eq!(entry.local_port, Some(socket.local_addr().unwrap().port()));
        assert!(icpt.session().is_some());
        assert_eq!(icpt.stats().udp.tx_datagrams, 1);
    }

    #[test]
    fn test_unbound_socket_gets_port() {
        let icpt = interceptor();
        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        let handle = SocketHandle(socket.as_raw_fd());
        icpt.connect(handle, "10.0.0.1:47998".parse().unwrap()).unwrap();
        let port = icpt.registry().lookup(handle).unwrap().local_port.unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_close_removes_entry() {
        let icpt = interceptor();
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        let fd = socket.as_raw_fd();
        icpt.register_udp(SocketHandle(fd), "10.0.0.1:47998".parse().unwrap()).unwrap();
        assert!(icpt.readiness(SocketHandle(fd)).is_some());

        // The interceptor closes the descriptor; keep std from closing it again
        let fd = std::os::fd::IntoRawFd::into_raw_fd(socket);
        icpt.close(SocketHandle(fd)).unwrap();
        assert!(icpt.registry().lookup(SocketHandle(fd)).is_none());
        assert!(icpt.readiness(SocketHandle(fd)).is_none());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let icpt = interceptor();
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        icpt.send_to(
            SocketHandle(socket.as_raw_fd()),
            b"x",
            MsgFlags::NONE,
            Some("10.0.0.1:1".parse().unwrap()),
        )
        .unwrap();
        icpt.teardown();
        icpt.teardown();
        assert!(icpt.session().is_none());
        assert!(icpt.registry().is_empty());
    }

    #[test]
    fn test_handle_shutdown_leaves_context_running() {
        let icpt = interceptor();
        let tunneled = UdpSocket::bind("0.0.0.0:0").unwrap();
        icpt.connect(SocketHandle(tunneled.as_raw_fd()), "10.0.0.1:9000".parse().unwrap())
            .unwrap();

        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        let other = UdpSocket::bind("127.0.0.1:0").unwrap();
        local.connect(other.local_addr().unwrap()).unwrap();
        icpt.shutdown(SocketHandle(local.as_raw_fd())).unwrap();

        assert_eq!(icpt.registry().len(), 1);
        assert!(icpt.registry().lookup(SocketHandle(tunneled.as_raw_fd())).is_some());
    }
}
