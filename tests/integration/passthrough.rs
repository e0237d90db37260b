//! Passthrough integration tests
//!
//! Handles whose traffic does not target the tunnel peer must behave exactly
//! as they would without the layer, and must never start the session.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use wg_intercept::{MsgFlags, SocketApi, SocketHandle};

use super::common::{interceptor_for, FakePeer};

#[test]
fn test_tcp_to_other_host_is_real() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let handle = SocketHandle(socket.as_raw_fd());

    icpt.connect(handle, addr).unwrap();
    assert_eq!(icpt.send(handle, b"hello", MsgFlags::NONE).unwrap(), 5);
    let mut buf = [0u8; 5];
    let n = icpt.recv(handle, &mut buf, MsgFlags::WAITALL).unwrap();
    assert_eq!(&buf[..n], b"hello");
    server.join().unwrap();

    assert!(icpt.registry().is_empty());
    assert!(icpt.session().is_none());
    assert_eq!(socket.peer_addr().unwrap().as_socket(), Some(addr));
}

#[test]
fn test_udp_to_other_host_is_real() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);

    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    icpt.connect(SocketHandle(a.as_raw_fd()), b.local_addr().unwrap()).unwrap();
    assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
    icpt.send(SocketHandle(a.as_raw_fd()), b"real", MsgFlags::NONE).unwrap();

    let mut buf = [0u8; 8];
    let (n, from) = icpt.recv_from(SocketHandle(b.as_raw_fd()), &mut buf, MsgFlags::NONE).unwrap();
    assert_eq!(&buf[..n], b"real");
    assert_eq!(from, Some(a.local_addr().unwrap()));
    assert!(icpt.session().is_none());
}

#[test]
fn test_errors_pass_through_verbatim() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut buf = [0u8; 8];
    let err = icpt
        .recv(SocketHandle(socket.as_raw_fd()), &mut buf, MsgFlags::DONTWAIT)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));

    let err = icpt.close(SocketHandle(-1)).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn test_handle_reuse_after_close() {
    let peer = FakePeer::new();
    let icpt = interceptor_for(&peer);

    let fd = UdpSocket::bind("0.0.0.0:0").unwrap().into_raw_fd();
    let peer_addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
    icpt.connect(SocketHandle(fd), peer_addr).unwrap();
    icpt.close(SocketHandle(fd)).unwrap();

    // A fresh socket is likely to get the same descriptor back
    let reused = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = UdpSocket::bind("127.0.0.1:0").unwrap();
    target.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let handle = SocketHandle(reused.as_raw_fd());
    assert!(icpt.registry().lookup(handle).is_none());

    icpt.send_to(handle, b"fresh", MsgFlags::NONE, target.local_addr().ok()).unwrap();
    let mut buf = [0u8; 8];
    let (n, _) = target.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"fresh");
}
