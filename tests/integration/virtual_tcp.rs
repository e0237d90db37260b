//! Virtual TCP integration tests
//!
//! The fake peer plays a hand-driven TCP server: it answers the SYN,
//! acknowledges data and injects segments in whatever order a test needs.
//!
//! # Test Categories
//!
//! 1. **Handshake**: blocking, non-blocking and refused connects
//! 2. **Transfer**: windowed sends and reordered receives
//! 3. **Close semantics**: FIN, shutdown, EOF and unblocking of blocked readers

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use wg_intercept::packet::{TcpFlags, TcpHeader};
use wg_intercept::{Interceptor, MsgFlags, OsSockets, SocketApi, SocketHandle};

use super::common::{interceptor_for, server_ip, FakePeer, Segment};

const PEER_ISS: u32 = 5000;
const WAIT: Duration = Duration::from_secs(5);

fn server_addr() -> SocketAddr {
    SocketAddr::new(server_ip(), 8080)
}

fn stream_fd(read_timeout: Option<Duration>) -> i32 {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_read_timeout(read_timeout).unwrap();
    socket.into_raw_fd()
}

fn header(seq: u32, ack: u32, flags: TcpFlags, window: u16) -> TcpHeader {
    TcpHeader {
        seq,
        ack,
        flags,
        window,
        mss: None,
    }
}

/// An established virtual connection and the peer's view of it
struct Established {
    icpt: Arc<Interceptor<OsSockets>>,
    handle: SocketHandle,
    /// Client address inside the tunnel
    client: SocketAddr,
    /// Next sequence number the peer expects from the client
    client_next: u32,
    /// Next sequence number the peer sends
    peer_next: u32,
}

fn wait_syn(peer: &FakePeer) -> Segment {
    loop {
        let seg = peer.recv_tcp(WAIT).expect("no SYN from client");
        if seg.flags.contains(TcpFlags::SYN) {
            return seg;
        }
    }
}

fn establish(peer: &FakePeer, window: u16) -> Established {
    let icpt = Arc::new(interceptor_for(peer));
    let handle = SocketHandle(stream_fd(Some(WAIT)));

    let connector = {
        let icpt = Arc::clone(&icpt);
        thread::spawn(move || icpt.connect(handle, server_addr()))
    };

    let syn = wait_syn(peer);
    assert_eq!(syn.dst, server_addr());
    let synack = TcpHeader {
        mss: Some(1360),
        ..header(
            PEER_ISS,
            syn.seq.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
            window,
        )
    };
    peer.send_tcp(server_addr(), syn.src, synack, &[]);
    connector.join().unwrap().unwrap();

    Established {
        icpt,
        handle,
        client: syn.src,
        client_next: syn.seq.wrapping_add(1),
        peer_next: PEER_ISS.wrapping_add(1),
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_blocking_connect_is_virtual() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);

    let entry = conn.icpt.registry().lookup(conn.handle).unwrap();
    assert!(entry.tcp_state.is_some());
    assert_eq!(entry.peer_address, Some(server_addr()));
    assert_eq!(conn.icpt.peer_address(conn.handle), Some(server_addr()));
    assert_eq!(conn.icpt.stats().tcp.opened, 1);
    assert!(conn.icpt.readiness(conn.handle).unwrap().writable);
}

#[test]
fn test_nonblocking_connect_in_progress() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_nonblocking(true).unwrap();
    let handle = SocketHandle(socket.as_raw_fd());

    let err = icpt.connect(handle, server_addr()).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINPROGRESS));

    let syn = wait_syn(&peer);
    let synack = TcpHeader {
        mss: Some(1360),
        ..header(PEER_ISS, syn.seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK, 65535)
    };
    peer.send_tcp(server_addr(), syn.src, synack, &[]);

    let deadline = std::time::Instant::now() + WAIT;
    while !icpt.readiness(handle).unwrap().writable {
        assert!(std::time::Instant::now() < deadline, "never became writable");
        thread::sleep(Duration::from_millis(10));
    }
    icpt.connect(handle, server_addr()).unwrap();
}

#[test]
fn test_connect_refused() {
    let peer = FakePeer::new();
    let icpt = Arc::new(interceptor_for(&peer));
    let handle = SocketHandle(stream_fd(Some(WAIT)));

    let connector = {
        let icpt = Arc::clone(&icpt);
        thread::spawn(move || icpt.connect(handle, server_addr()))
    };
    let syn = wait_syn(&peer);
    peer.send_tcp(
        server_addr(),
        syn.src,
        header(0, syn.seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK, 0),
        &[],
    );

    let err = connector.join().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
}

// ============================================================================
// Transfer
// ============================================================================

#[test]
fn test_send_10000_bytes_through_small_window() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 1400);
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let sender = {
        let icpt = Arc::clone(&conn.icpt);
        let data = data.clone();
        let handle = conn.handle;
        thread::spawn(move || icpt.send(handle, &data, MsgFlags::NONE))
    };

    let mut received = Vec::new();
    let mut expected = conn.client_next;
    while received.len() < data.len() {
        let seg = peer.recv_tcp(WAIT).expect("transfer stalled");
        if seg.payload.is_empty() {
            continue;
        }
        assert!(seg.payload.len() <= 1400, "segment exceeds the peer window");
        if seg.seq == expected {
            received.extend_from_slice(&seg.payload);
            expected = expected.wrapping_add(seg.payload.len() as u32);
        }
        peer.send_tcp(
            server_addr(),
            conn.client,
            header(conn.peer_next, expected, TcpFlags::ACK, 1400),
            &[],
        );
    }

    assert_eq!(sender.join().unwrap().unwrap(), data.len());
    assert_eq!(received, data);
}

#[test]
fn test_receive_reordered_and_duplicated() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 239) as u8).collect();

    let send = |offset: usize, len: usize| {
        peer.send_tcp(
            server_addr(),
            conn.client,
            header(
                conn.peer_next.wrapping_add(offset as u32),
                conn.client_next,
                TcpFlags::ACK | TcpFlags::PSH,
                65535,
            ),
            &data[offset..offset + len],
        );
    };
    send(1000, 1000);
    send(0, 1000);
    send(0, 1000);
    send(500, 1000);
    send(2000, 1000);

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.len() < data.len() {
        let n = conn.icpt.recv(conn.handle, &mut buf, MsgFlags::NONE).unwrap();
        assert!(n > 0, "unexpected EOF");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, data);

    // FIN after the data reads as EOF
    peer.send_tcp(
        server_addr(),
        conn.client,
        header(
            conn.peer_next.wrapping_add(3000),
            conn.client_next,
            TcpFlags::FIN | TcpFlags::ACK,
            65535,
        ),
        &[],
    );
    assert_eq!(conn.icpt.recv(conn.handle, &mut buf, MsgFlags::NONE).unwrap(), 0);
}

#[test]
fn test_recv_timeout_would_block() {
    let peer = FakePeer::new();
    let icpt = Arc::new(interceptor_for(&peer));
    let handle = SocketHandle(stream_fd(Some(Duration::from_millis(100))));

    let connector = {
        let icpt = Arc::clone(&icpt);
        thread::spawn(move || icpt.connect(handle, server_addr()))
    };
    let syn = wait_syn(&peer);
    let synack = TcpHeader {
        mss: Some(1360),
        ..header(PEER_ISS, syn.seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK, 65535)
    };
    peer.send_tcp(server_addr(), syn.src, synack, &[]);
    connector.join().unwrap().unwrap();

    let mut buf = [0u8; 16];
    let err = icpt.recv(handle, &mut buf, MsgFlags::NONE).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}

// ============================================================================
// Close Semantics
// ============================================================================

#[test]
fn test_close_sends_fin() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);

    conn.icpt.close(conn.handle).unwrap();
    loop {
        let seg = peer.recv_tcp(WAIT).expect("no FIN after close");
        if seg.flags.contains(TcpFlags::FIN) {
            assert_eq!(seg.seq, conn.client_next);
            break;
        }
    }
    assert!(conn.icpt.registry().lookup(conn.handle).is_none());
}

#[test]
fn test_shutdown_drains_then_eof() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);

    peer.send_tcp(
        server_addr(),
        conn.client,
        header(conn.peer_next, conn.client_next, TcpFlags::ACK | TcpFlags::PSH, 65535),
        b"tail",
    );
    let deadline = std::time::Instant::now() + WAIT;
    while !conn.icpt.readiness(conn.handle).unwrap().readable {
        assert!(std::time::Instant::now() < deadline, "data never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    conn.icpt.shutdown(conn.handle).unwrap();
    loop {
        let seg = peer.recv_tcp(WAIT).expect("no FIN after shutdown");
        if seg.flags.contains(TcpFlags::FIN) {
            assert_eq!(seg.seq, conn.client_next);
            break;
        }
    }

    let mut buf = [0u8; 16];
    let n = conn.icpt.recv(conn.handle, &mut buf, MsgFlags::NONE).unwrap();
    assert_eq!(&buf[..n], b"tail");
    assert_eq!(conn.icpt.recv(conn.handle, &mut buf, MsgFlags::NONE).unwrap(), 0);

    let err = conn.icpt.send(conn.handle, b"more", MsgFlags::NONE).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    assert!(conn.icpt.registry().lookup(conn.handle).is_some());
}

#[test]
fn test_close_unblocks_reader() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);

    let reader = {
        let icpt = Arc::clone(&conn.icpt);
        let handle = conn.handle;
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            icpt.recv(handle, &mut buf, MsgFlags::NONE)
        })
    };
    thread::sleep(Duration::from_millis(100));
    conn.icpt.close(conn.handle).unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn test_peer_reset() {
    let peer = FakePeer::new();
    let conn = establish(&peer, 65535);

    peer.send_tcp(
        server_addr(),
        conn.client,
        header(conn.peer_next, conn.client_next, TcpFlags::RST | TcpFlags::ACK, 0),
        &[],
    );

    let mut buf = [0u8; 16];
    let err = conn.icpt.recv(conn.handle, &mut buf, MsgFlags::NONE).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
}
