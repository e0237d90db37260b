//! UDP tunnel path integration tests
//!
//! # Test Categories
//!
//! 1. **Inject delivery**: connect/sendto/recvfrom on application sockets
//! 2. **Direct delivery**: registered sockets read from their queue
//! 3. **Close semantics**: blocked readers wake with EBADF

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wg_intercept::{MsgFlags, SocketApi, SocketHandle, TunnelMode};

use super::common::{interceptor_for, server_ip, tunnel_ip, FakePeer};

fn peer_addr(port: u16) -> SocketAddr {
    SocketAddr::new(server_ip(), port)
}

fn bound_socket() -> UdpSocket {
    let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    socket
}

// ============================================================================
// Inject Delivery
// ============================================================================

#[test]
fn test_connect_then_ping_pong() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = bound_socket();
    let handle = SocketHandle(socket.as_raw_fd());
    let local_port = socket.local_addr().unwrap().port();

    icpt.connect(handle, peer_addr(47998)).unwrap();
    // The real socket was never connected
    assert!(socket.peer_addr().is_err());

    let sent = icpt.send_to(handle, b"ping", MsgFlags::NONE, Some(peer_addr(47998))).unwrap();
    assert_eq!(sent, 4);

    let (src, dst, payload) = peer.recv_udp();
    assert_eq!(payload, b"ping");
    assert_eq!(src, SocketAddr::new(tunnel_ip(), local_port));
    assert_eq!(dst, peer_addr(47998));

    peer.send_udp(dst, src, b"pong");

    let mut buf = [0u8; 64];
    let (n, from) = icpt.recv_from(handle, &mut buf, MsgFlags::NONE).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, Some(peer_addr(47998)));
    assert_eq!(icpt.stats().udp.injected, 1);
}

#[test]
fn test_sendto_auto_registers_and_delivers_each_datagram_once() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = bound_socket();
    let handle = SocketHandle(socket.as_raw_fd());

    for i in 0..20u8 {
        let payload = vec![i; usize::from(i) + 1];
        icpt.send_to(handle, &payload, MsgFlags::NONE, Some(peer_addr(5000))).unwrap();
    }

    let entry = icpt.registry().lookup(handle).unwrap();
    assert_eq!(entry.mode, TunnelMode::InjectDelivery);

    for i in 0..20u8 {
        let (_, dst, payload) = peer.recv_udp();
        assert_eq!(dst, peer_addr(5000));
        assert_eq!(payload, vec![i; usize::from(i) + 1]);
    }
    assert!(peer.recv_datagram(Duration::from_millis(200)).is_none());
    assert_eq!(icpt.stats().udp.tx_datagrams, 20);
}

#[test]
fn test_send_on_connected_handle_uses_peer() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = bound_socket();
    let handle = SocketHandle(socket.as_raw_fd());

    icpt.connect(handle, peer_addr(6000)).unwrap();
    assert_eq!(icpt.send(handle, b"hello", MsgFlags::NONE).unwrap(), 5);

    let (_, dst, payload) = peer.recv_udp();
    assert_eq!(dst, peer_addr(6000));
    assert_eq!(payload, b"hello");
}

#[test]
fn test_oversized_datagram_rejected() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = bound_socket();
    let handle = SocketHandle(socket.as_raw_fd());

    let payload = vec![0u8; 70_000];
    let err = icpt
        .send_to(handle, &payload, MsgFlags::NONE, Some(peer_addr(5000)))
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EMSGSIZE));
}

// ============================================================================
// Direct Delivery
// ============================================================================

#[test]
fn test_registered_handle_reads_from_queue() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = bound_socket();
    let handle = SocketHandle(socket.as_raw_fd());

    icpt.register_udp(handle, peer_addr(7000)).unwrap();
    icpt.send_to(handle, b"q", MsgFlags::NONE, None).unwrap();
    let (src, dst, _) = peer.recv_udp();

    peer.send_udp(dst, src, b"first");
    peer.send_udp(dst, src, b"second");

    let mut buf = [0u8; 16];
    let (n, from) = icpt.recv_from(handle, &mut buf, MsgFlags::NONE).unwrap();
    assert_eq!(&buf[..n], b"first");
    assert_eq!(from, Some(peer_addr(7000)));

    let n = icpt.recv(handle, &mut buf, MsgFlags::NONE).unwrap();
    assert_eq!(&buf[..n], b"second");

    let err = icpt.recv(handle, &mut buf, MsgFlags::DONTWAIT).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    assert_eq!(icpt.stats().udp.delivered_direct, 2);
}

#[test]
fn test_early_datagrams_flushed_on_registration() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);

    // Start the session from another socket so the peer knows where to answer
    let starter = bound_socket();
    icpt.send_to(SocketHandle(starter.as_raw_fd()), b"hi", MsgFlags::NONE, Some(peer_addr(1)))
        .unwrap();
    peer.recv_udp();

    let socket = bound_socket();
    let local_port = socket.local_addr().unwrap().port();
    peer.send_udp(
        peer_addr(7001),
        SocketAddr::new(tunnel_ip(), local_port),
        b"early",
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while icpt.stats().udp.pending_buffered == 0 {
        assert!(std::time::Instant::now() < deadline, "datagram never buffered");
        thread::sleep(Duration::from_millis(10));
    }

    let handle = SocketHandle(socket.as_raw_fd());
    icpt.register_udp(handle, peer_addr(7001)).unwrap();
    let mut buf = [0u8; 16];
    let (n, from) = icpt.recv_from(handle, &mut buf, MsgFlags::DONTWAIT).unwrap();
    assert_eq!(&buf[..n], b"early");
    assert_eq!(from, Some(peer_addr(7001)));
    assert_eq!(icpt.stats().udp.pending_flushed, 1);
}

// ============================================================================
// Close Semantics
// ============================================================================

#[test]
fn test_close_unblocks_queue_reader() {
    let peer = FakePeer::new();
    let icpt = Arc::new(interceptor_for(&peer));
    let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
    let fd = socket.into_raw_fd();
    icpt.register_udp(SocketHandle(fd), peer_addr(7002)).unwrap();

    let reader = {
        let icpt = Arc::clone(&icpt);
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            icpt.recv_from(SocketHandle(fd), &mut buf, MsgFlags::NONE)
        })
    };
    thread::sleep(Duration::from_millis(100));
    icpt.close(SocketHandle(fd)).unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn test_close_unblocks_inject_reader() {
    let peer = FakePeer::new();
    let icpt = Arc::new(interceptor_for(&peer));
    let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
    let fd = socket.into_raw_fd();
    icpt.connect(SocketHandle(fd), peer_addr(7003)).unwrap();

    let reader = {
        let icpt = Arc::clone(&icpt);
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            icpt.recv_from(SocketHandle(fd), &mut buf, MsgFlags::NONE)
        })
    };
    thread::sleep(Duration::from_millis(100));
    icpt.close(SocketHandle(fd)).unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    assert!(icpt.registry().lookup(SocketHandle(fd)).is_none());
}
