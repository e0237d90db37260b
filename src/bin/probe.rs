//! wg-intercept-probe: check that the tunnel peer answers through the layer
//!
//! Opens a UDP socket, connects it to the tunnel peer through the
//! interceptor, sends a probe datagram and waits for a reply.
//!
//! # Usage
//!
//! ```bash
//! wg-intercept-probe -c /etc/wg-intercept/config.json -p 47998
//! WG_INTERCEPT_LOG_LEVEL=debug wg-intercept-probe -c config.json
//! ```

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use wg_intercept::config::load_config_with_env;
use wg_intercept::{init_logging, Interceptor, MsgFlags, SocketApi, SocketHandle};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Peer port to probe (when the config has no server port)
    port: u16,
    /// Payload to send
    payload: String,
    /// Reply timeout
    timeout: Duration,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: PathBuf::from("/etc/wg-intercept/config.json"),
            port: 7,
            payload: "ping".into(),
            timeout: Duration::from_secs(5),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        parsed.config_path = PathBuf::from(path);
                    }
                }
                "-p" | "--port" => {
                    let value = args.next().context("--port needs a value")?;
                    parsed.port = value.parse().with_context(|| format!("Invalid port: {value}"))?;
                }
                "-m" | "--message" => {
                    parsed.payload = args.next().context("--message needs a value")?;
                }
                "-t" | "--timeout" => {
                    let value = args.next().context("--timeout needs a value")?;
                    let secs: u64 = value.parse().with_context(|| format!("Invalid timeout: {value}"))?;
                    parsed.timeout = Duration::from_secs(secs);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("wg-intercept-probe v{}", wg_intercept::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }
        Ok(parsed)
    }
}

fn print_help() {
    println!(
        r"wg-intercept-probe v{}

Send one UDP datagram to the tunnel peer through the interception layer
and wait for a reply.

USAGE:
    wg-intercept-probe [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/wg-intercept/config.json]
    -p, --port <PORT>       Peer port when routing.server_port is unset [default: 7]
    -m, --message <TEXT>    Probe payload [default: ping]
    -t, --timeout <SECS>    Reply timeout [default: 5]
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    WG_INTERCEPT_ENDPOINT    Override the WireGuard endpoint
    WG_INTERCEPT_SERVER_IP   Override the peer address inside the tunnel
    WG_INTERCEPT_TUNNEL_IP   Override this client's tunnel address
    WG_INTERCEPT_LOG_LEVEL   Override log level (trace, debug, info, warn, error)
",
        wg_intercept::VERSION
    );
}

fn main() -> Result<()> {
    let args = Args::parse()?;
    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load {}", args.config_path.display()))?;
    init_logging(&config.log);

    let peer = SocketAddr::new(
        config.routing.server_ip,
        config.routing.server_port.unwrap_or(args.port),
    );
    let interceptor = Interceptor::from_config(config).context("Failed to build interceptor")?;

    let bind: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).context("Failed to open UDP socket")?;
    socket.set_read_timeout(Some(args.timeout))?;
    let handle = SocketHandle(socket.as_raw_fd());

    interceptor.connect(handle, peer).context("connect through interceptor")?;
    let started = Instant::now();
    let sent = interceptor
        .send_to(handle, args.payload.as_bytes(), MsgFlags::NONE, None)
        .context("send through tunnel")?;
    info!("Sent {} byte probe to {}", sent, peer);

    let mut buf = vec![0u8; 65535];
    let result = interceptor.recv_from(handle, &mut buf, MsgFlags::NONE);
    let stats = interceptor.stats();
    interceptor.close(handle).ok();
    std::mem::forget(socket);

    match result {
        Ok((n, source)) => {
            let source = source.map_or_else(|| "unknown".to_string(), |s| s.to_string());
            println!(
                "reply from {}: {} bytes in {:?}: {}",
                source,
                n,
                started.elapsed(),
                String::from_utf8_lossy(&buf[..n])
            );
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
            warn!("No reply within {:?}", args.timeout);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            bail!("no reply from {peer} within {:?}", args.timeout)
        }
        Err(e) => Err(e).context("receive reply"),
    }
}
