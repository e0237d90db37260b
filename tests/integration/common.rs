//! Shared fixtures: identity cipher, fake WireGuard peer, config helpers

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wg_intercept::config::{Config, RoutingConfig};
use wg_intercept::error::InterceptError;
use wg_intercept::packet::{build_tcp_packet, build_udp_packet, parse_packet, ParsedPacket, TcpFlags, TcpHeader};
use wg_intercept::tunnel::{derive_public_key, generate_private_key, Decapsulated, TunnelCipher, WgTunnelConfig};
use wg_intercept::{Interceptor, OsSockets};

pub const TUNNEL_IP: &str = "10.0.0.2";
pub const SERVER_IP: &str = "10.0.0.1";

/// Cipher that passes packets through unchanged
#[derive(Debug, Default)]
pub struct IdentityCipher;

impl TunnelCipher for IdentityCipher {
    fn encapsulate(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, InterceptError> {
        Ok(Some(packet.to_vec()))
    }

    fn decapsulate(&self, datagram: &[u8]) -> Result<Decapsulated, InterceptError> {
        Ok(Decapsulated {
            packets: vec![datagram.to_vec()],
            to_network: Vec::new(),
        })
    }

    fn update_timers(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// An owned copy of a TCP segment seen by the fake peer
#[derive(Debug, Clone)]
pub struct Segment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// The far end of the tunnel, speaking cleartext IP over loopback UDP
pub struct FakePeer {
    socket: UdpSocket,
    client: Mutex<Option<SocketAddr>>,
}

impl FakePeer {
    pub fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            socket,
            client: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Next raw datagram from the session, or `None` after `timeout`
    pub fn recv_datagram(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.socket.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = vec![0u8; 65536];
        let (n, from) = self.socket.recv_from(&mut buf).ok()?;
        *self.client.lock() = Some(from);
        buf.truncate(n);
        Some(buf)
    }

    /// Next UDP packet: (source, destination, payload)
    pub fn recv_udp(&self) -> (SocketAddr, SocketAddr, Vec<u8>) {
        loop {
            let packet = self.recv_datagram(Duration::from_secs(5)).expect("no UDP packet from session");
            if let Some(ParsedPacket::Udp(view)) = parse_packet(&packet) {
                return (view.src, view.dst, view.payload.to_vec());
            }
        }
    }

    /// Next TCP segment, or `None` after `timeout`
    pub fn recv_tcp(&self, timeout: Duration) -> Option<Segment> {
        loop {
            let packet = self.recv_datagram(timeout)?;
            if let Some(ParsedPacket::Tcp(view)) = parse_packet(&packet) {
                return Some(Segment {
                    src: view.src,
                    dst: view.dst,
                    seq: view.seq,
                    ack: view.ack,
                    flags: view.flags,
                    window: view.window,
                    payload: view.payload.to_vec(),
                });
            }
        }
    }

    /// Send a cleartext IP packet to the session
    pub fn send_packet(&self, packet: &[u8]) {
        let client = self.client.lock().expect("session has not talked to the peer yet");
        self.socket.send_to(packet, client).unwrap();
    }

    pub fn send_udp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        self.send_packet(&build_udp_packet(src, dst, payload).unwrap());
    }

    pub fn send_tcp(&self, src: SocketAddr, dst: SocketAddr, header: TcpHeader, payload: &[u8]) {
        self.send_packet(&build_tcp_packet(src, dst, &header, payload).unwrap());
    }
}

pub fn tunnel_ip() -> IpAddr {
    TUNNEL_IP.parse().unwrap()
}

pub fn server_ip() -> IpAddr {
    SERVER_IP.parse().unwrap()
}

/// Configuration pointing the tunnel at `peer`
pub fn config_for(peer: &FakePeer) -> Config {
    let tunnel = WgTunnelConfig::new(
        generate_private_key(),
        derive_public_key(&generate_private_key()).unwrap(),
        peer.addr().to_string(),
    );
    Config::new(tunnel, RoutingConfig::new(tunnel_ip(), server_ip()))
}

pub fn interceptor_with(config: Config) -> Interceptor<OsSockets> {
    Interceptor::new(config, Arc::new(IdentityCipher), OsSockets::new()).unwrap()
}

pub fn interceptor_for(peer: &FakePeer) -> Interceptor<OsSockets> {
    interceptor_with(config_for(peer))
}
