//! Configuration file integration tests
//!
//! Builds an interceptor from a config file on disk with the real boringtun
//! cipher and checks the session's first words to the endpoint.

use std::io::Write;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::time::Duration;

use tempfile::NamedTempFile;

use wg_intercept::config::load_config;
use wg_intercept::tunnel::{derive_public_key, generate_private_key};
use wg_intercept::{Interceptor, MsgFlags, SocketApi, SocketHandle};

use super::common::FakePeer;

/// WireGuard handshake initiation: message type 1, 148 bytes
const HANDSHAKE_INITIATION: (u8, usize) = (1, 148);

fn write_config(peer: &FakePeer) -> NamedTempFile {
    let json = format!(
        r#"{{
            "tunnel": {{
                "private_key": "{}",
                "peer_public_key": "{}",
                "peer_endpoint": "{}",
                "persistent_keepalive": null
            }},
            "routing": {{ "tunnel_ip": "10.0.0.2", "server_ip": "10.0.0.1", "server_port": 47998 }},
            "udp": {{ "queue_capacity": 64 }},
            "log": {{ "level": "debug", "format": "text" }}
        }}"#,
        generate_private_key(),
        derive_public_key(&generate_private_key()).unwrap(),
        peer.addr()
    );
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_boringtun_session_starts_with_handshake() {
    let peer = FakePeer::new();
    let file = write_config(&peer);
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.routing.server_port, Some(47998));
    assert_eq!(config.udp.queue_capacity, 64);

    let icpt = Interceptor::from_config(config).unwrap();
    assert!(icpt.session().is_none());

    let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
    let sent = icpt
        .send_to(
            SocketHandle(socket.as_raw_fd()),
            b"ping",
            MsgFlags::NONE,
            Some("10.0.0.1:47998".parse().unwrap()),
        )
        .unwrap();
    assert_eq!(sent, 4);

    let first = peer
        .recv_datagram(Duration::from_secs(5))
        .expect("no handshake from session");
    assert_eq!((first[0], first.len()), HANDSHAKE_INITIATION);
    assert!(icpt.session().unwrap().is_running());
}

#[test]
fn test_other_port_is_not_tunneled() {
    let peer = FakePeer::new();
    let file = write_config(&peer);
    let icpt = Interceptor::from_config(load_config(file.path()).unwrap()).unwrap();

    // server_port pins the peer to one port; other ports on its IP pass through
    assert!(!icpt.classifier().is_tunnel_peer(&"10.0.0.1:53".parse().unwrap()));
    assert!(icpt.classifier().is_tunnel_peer(&"10.0.0.1:47998".parse().unwrap()));
}
