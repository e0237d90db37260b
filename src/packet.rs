//! IP packet construction and parsing for tunnel traffic
//!
//! The tunnel carries raw IP packets. Outbound UDP datagrams and virtual TCP
//! segments are wrapped in an IPv4 or IPv6 header addressed from the local
//! tunnel address to the server; inbound packets are parsed back into
//! transport views borrowing the decrypted buffer.
//!
//! Only what the interception layer emits and consumes is supported:
//! unfragmented IPv4 packets and IPv6 packets without extension headers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use thiserror::Error;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// IPv4 header length (no options)
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// TCP header length without options
pub const TCP_HEADER_LEN: usize = 20;

/// Largest UDP payload an IPv4 packet can carry
pub const MAX_UDP_PAYLOAD_V4: usize = 65_507;

/// Largest UDP payload an IPv6 packet (without jumbograms) can carry
pub const MAX_UDP_PAYLOAD_V6: usize = 65_527;

const DEFAULT_TTL: u8 = 64;

/// IPv4 identification counter
static IPV4_IDENT: AtomicU16 = AtomicU16::new(1);

/// Packet building errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Source and destination are different address families
    #[error("Address family mismatch: {src} -> {dst}")]
    FamilyMismatch { src: IpAddr, dst: IpAddr },

    /// Payload does not fit in one IP packet
    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);

    /// Check whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::SYN, 'S'),
            (Self::ACK, '.'),
            (Self::FIN, 'F'),
            (Self::RST, 'R'),
            (Self::PSH, 'P'),
        ];
        for (flag, c) in names {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Header fields of an outbound TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option, only meaningful on SYN segments
    pub mss: Option<u16>,
}

/// Parsed UDP datagram borrowing the packet buffer
#[derive(Debug, Clone, Copy)]
pub struct UdpView<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
}

/// Parsed TCP segment borrowing the packet buffer
#[derive(Debug, Clone, Copy)]
pub struct TcpView<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// A parsed inbound IP packet
#[derive(Debug, Clone, Copy)]
pub enum ParsedPacket<'a> {
    Udp(UdpView<'a>),
    Tcp(TcpView<'a>),
    /// Any other protocol (ICMP, fragments, extension headers)
    Other { src: IpAddr, protocol: u8 },
}

impl ParsedPacket<'_> {
    /// Source IP of the packet
    #[must_use]
    pub fn source_ip(&self) -> IpAddr {
        match self {
            Self::Udp(v) => v.src.ip(),
            Self::Tcp(v) => v.src.ip(),
            Self::Other { src, .. } => *src,
        }
    }
}

/// Largest UDP payload for a destination's address family
#[must_use]
pub const fn max_udp_payload(dst: &SocketAddr) -> usize {
    match dst {
        SocketAddr::V4(_) => MAX_UDP_PAYLOAD_V4,
        SocketAddr::V6(_) => MAX_UDP_PAYLOAD_V6,
    }
}

/// Build an IP+UDP packet
///
/// # Errors
///
/// Returns `PacketError` if the addresses are of different families or the
/// payload exceeds the UDP maximum.
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let max = max_udp_payload(&dst);
    if payload.len() > max {
        return Err(PacketError::TooLarge { size: payload.len(), max });
    }

    let mut segment = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    segment.extend_from_slice(&src.port().to_be_bytes());
    segment.extend_from_slice(&dst.port().to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    segment.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);

    let mut checksum = transport_checksum(src.ip(), dst.ip(), IPPROTO_UDP, &segment)?;
    // A computed zero is transmitted as all ones
    if checksum == 0 {
        checksum = 0xffff;
    }
    segment[6..8].copy_from_slice(&checksum.to_be_bytes());

    wrap_ip(src.ip(), dst.ip(), IPPROTO_UDP, &segment)
}

/// Build an IP+TCP packet
///
/// # Errors
///
/// Returns `PacketError` if the addresses are of different families or the
/// segment does not fit in one IP packet.
pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    header: &TcpHeader,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let options_len = if header.mss.is_some() { 4 } else { 0 };
    let header_len = TCP_HEADER_LEN + options_len;

    let mut segment = Vec::with_capacity(header_len + payload.len());
    segment.extend_from_slice(&src.port().to_be_bytes());
    segment.extend_from_slice(&dst.port().to_be_bytes());
    segment.extend_from_slice(&header.seq.to_be_bytes());
    segment.extend_from_slice(&header.ack.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    segment.push(((header_len / 4) as u8) << 4);
    segment.push(header.flags.0);
    segment.extend_from_slice(&header.window.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    if let Some(mss) = header.mss {
        segment.extend_from_slice(&[2, 4]);
        segment.extend_from_slice(&mss.to_be_bytes());
    }
    segment.extend_from_slice(payload);

    let checksum = transport_checksum(src.ip(), dst.ip(), IPPROTO_TCP, &segment)?;
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    wrap_ip(src.ip(), dst.ip(), IPPROTO_TCP, &segment)
}

fn wrap_ip(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> Result<Vec<u8>, PacketError> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = IPV4_HEADER_LEN + segment.len();
            let total16 = u16::try_from(total).map_err(|_| PacketError::TooLarge {
                size: segment.len(),
                max: usize::from(u16::MAX) - IPV4_HEADER_LEN,
            })?;
            let mut packet = Vec::with_capacity(total);
            packet.push(0x45);
            packet.push(0);
            packet.extend_from_slice(&total16.to_be_bytes());
            packet.extend_from_slice(&IPV4_IDENT.fetch_add(1, Ordering::Relaxed).to_be_bytes());
            packet.extend_from_slice(&0x4000u16.to_be_bytes()); // DF
            packet.push(DEFAULT_TTL);
            packet.push(protocol);
            packet.extend_from_slice(&[0, 0]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            let checksum = finish_checksum(sum_words(&packet[..IPV4_HEADER_LEN], 0));
            packet[10..12].copy_from_slice(&checksum.to_be_bytes());
            packet.extend_from_slice(segment);
            Ok(packet)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let payload_len = u16::try_from(segment.len()).map_err(|_| PacketError::TooLarge {
                size: segment.len(),
                max: usize::from(u16::MAX),
            })?;
            let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + segment.len());
            packet.extend_from_slice(&0x6000_0000u32.to_be_bytes());
            packet.extend_from_slice(&payload_len.to_be_bytes());
            packet.push(protocol);
            packet.push(DEFAULT_TTL);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            packet.extend_from_slice(segment);
            Ok(packet)
        }
        (src, dst) => Err(PacketError::FamilyMismatch { src, dst }),
    }
}

/// Parse an inbound IP packet
///
/// Returns `None` for packets too short or malformed to carry a header.
#[must_use]
pub fn parse_packet(packet: &[u8]) -> Option<ParsedPacket<'_>> {
    let version = packet.first()? >> 4;
    let (src, dst, protocol, transport) = match version {
        4 => {
            if packet.len() < IPV4_HEADER_LEN {
                return None;
            }
            let ihl = usize::from(packet[0] & 0x0f) * 4;
            let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
            if ihl < IPV4_HEADER_LEN || total < ihl || packet.len() < total {
                return None;
            }
            let src_bytes: [u8; 4] = packet[12..16].try_into().ok()?;
            let dst_bytes: [u8; 4] = packet[16..20].try_into().ok()?;
            let src = IpAddr::V4(Ipv4Addr::from(src_bytes));
            let frag = u16::from_be_bytes([packet[6], packet[7]]);
            // More-fragments flag or a non-zero offset
            if frag & 0x3fff != 0 {
                return Some(ParsedPacket::Other { src, protocol: packet[9] });
            }
            (src, IpAddr::V4(Ipv4Addr::from(dst_bytes)), packet[9], &packet[ihl..total])
        }
        6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return None;
            }
            let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
            let end = IPV6_HEADER_LEN + payload_len;
            if packet.len() < end {
                return None;
            }
            let src_bytes: [u8; 16] = packet[8..24].try_into().ok()?;
            let dst_bytes: [u8; 16] = packet[24..40].try_into().ok()?;
            (
                IpAddr::V6(Ipv6Addr::from(src_bytes)),
                IpAddr::V6(Ipv6Addr::from(dst_bytes)),
                packet[6],
                &packet[IPV6_HEADER_LEN..end],
            )
        }
        _ => return None,
    };

    match protocol {
        IPPROTO_UDP => {
            if transport.len() < UDP_HEADER_LEN {
                return None;
            }
            let sport = u16::from_be_bytes([transport[0], transport[1]]);
            let dport = u16::from_be_bytes([transport[2], transport[3]]);
            let len = usize::from(u16::from_be_bytes([transport[4], transport[5]]));
            if len < UDP_HEADER_LEN || len > transport.len() {
                return None;
            }
            Some(ParsedPacket::Udp(UdpView {
                src: SocketAddr::new(src, sport),
                dst: SocketAddr::new(dst, dport),
                payload: &transport[UDP_HEADER_LEN..len],
            }))
        }
        IPPROTO_TCP => {
            if transport.len() < TCP_HEADER_LEN {
                return None;
            }
            let data_offset = usize::from(transport[12] >> 4) * 4;
            if data_offset < TCP_HEADER_LEN || data_offset > transport.len() {
                return None;
            }
            Some(ParsedPacket::Tcp(TcpView {
                src: SocketAddr::new(src, u16::from_be_bytes([transport[0], transport[1]])),
                dst: SocketAddr::new(dst, u16::from_be_bytes([transport[2], transport[3]])),
                seq: u32::from_be_bytes([transport[4], transport[5], transport[6], transport[7]]),
                ack: u32::from_be_bytes([transport[8], transport[9], transport[10], transport[11]]),
                flags: TcpFlags(transport[13] & 0x3f),
                window: u16::from_be_bytes([transport[14], transport[15]]),
                mss: parse_mss_option(&transport[TCP_HEADER_LEN..data_offset]),
                payload: &transport[data_offset..],
            }))
        }
        _ => Some(ParsedPacket::Other { src, protocol }),
    }
}

fn parse_mss_option(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            0 => return None,
            1 => options = &options[1..],
            _ => {
                let len = usize::from(*options.get(1)?);
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == 2 && len == 4 {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> Result<u16, PacketError> {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let sum = sum_words(&s.octets(), 0);
            sum_words(&d.octets(), sum)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let sum = sum_words(&s.octets(), 0);
            sum_words(&d.octets(), sum)
        }
        (src, dst) => return Err(PacketError::FamilyMismatch { src, dst }),
    };
    sum += u32::from(protocol);
    #[allow(clippy::cast_possible_truncation)]
    {
        sum += segment.len() as u32;
    }
    Ok(finish_checksum(sum_words(segment, sum)))
}

/// One's complement sum of big-endian 16-bit words
fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn finish_checksum(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_udp_v4_parse_back() {
        let src = v4("10.0.0.2:40000");
        let dst = v4("10.0.0.1:47998");
        let packet = build_udp_packet(src, dst, b"ping").unwrap();
        assert_eq!(packet.len(), IPV4_HEADER_LEN + UDP_HEADER_LEN + 4);
        // Header checksum verifies to zero
        assert_eq!(finish_checksum(sum_words(&packet[..IPV4_HEADER_LEN], 0)), 0);

        match parse_packet(&packet) {
            Some(ParsedPacket::Udp(view)) => {
                assert_eq!(view.src, src);
                assert_eq!(view.dst, dst);
                assert_eq!(view.payload, b"ping");
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_udp_checksum_verifies() {
        let src = v4("10.0.0.2:40000");
        let dst = v4("10.0.0.1:47998");
        let packet = build_udp_packet(src, dst, b"odd").unwrap();
        let segment = &packet[IPV4_HEADER_LEN..];
        let mut sum = sum_words(&[10, 0, 0, 2, 10, 0, 0, 1], 0);
        sum += u32::from(IPPROTO_UDP) + segment.len() as u32;
        assert_eq!(finish_checksum(sum_words(segment, sum)), 0);
    }

    #[test]
    fn test_udp_v6_parse_back() {
        let src: SocketAddr = "[fd00::2]:5000".parse().unwrap();
        let dst: SocketAddr = "[fd00::1]:6000".parse().unwrap();
        let packet = build_udp_packet(src, dst, b"hello v6").unwrap();
        assert_eq!(packet[0] >> 4, 6);
        match parse_packet(&packet) {
            Some(ParsedPacket::Udp(view)) => {
                assert_eq!(view.src, src);
                assert_eq!(view.payload, b"hello v6");
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_family_mismatch() {
        let src = v4("10.0.0.2:1");
        let dst: SocketAddr = "[fd00::1]:2".parse().unwrap();
        assert!(matches!(
            build_udp_packet(src, dst, b"x"),
            Err(PacketError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_udp_too_large() {
        let payload = vec![0u8; MAX_UDP_PAYLOAD_V4 + 1];
        let err = build_udp_packet(v4("10.0.0.2:1"), v4("10.0.0.1:2"), &payload).unwrap_err();
        assert_eq!(err, PacketError::TooLarge { size: MAX_UDP_PAYLOAD_V4 + 1, max: MAX_UDP_PAYLOAD_V4 });
    }

    #[test]
    fn test_tcp_syn_with_mss() {
        let header = TcpHeader {
            seq: 0xffff_fff0,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 65535,
            mss: Some(1360),
        };
        let packet = build_tcp_packet(v4("10.0.0.2:49152"), v4("10.0.0.1:48010"), &header, &[]).unwrap();
        match parse_packet(&packet) {
            Some(ParsedPacket::Tcp(view)) => {
                assert_eq!(view.seq, 0xffff_fff0);
                assert!(view.flags.contains(TcpFlags::SYN));
                assert!(!view.flags.contains(TcpFlags::ACK));
                assert_eq!(view.mss, Some(1360));
                assert!(view.payload.is_empty());
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_tcp_data_segment() {
        let header = TcpHeader {
            seq: 1000,
            ack: 2000,
            flags: TcpFlags::ACK | TcpFlags::PSH,
            window: 4096,
            mss: None,
        };
        let packet = build_tcp_packet(v4("10.0.0.2:49152"), v4("10.0.0.1:48010"), &header, b"data").unwrap();
        match parse_packet(&packet) {
            Some(ParsedPacket::Tcp(view)) => {
                assert_eq!(view.ack, 2000);
                assert_eq!(view.window, 4096);
                assert_eq!(view.flags, TcpFlags::ACK | TcpFlags::PSH);
                assert_eq!(view.payload, b"data");
                assert_eq!(view.mss, None);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let packet = build_udp_packet(v4("10.0.0.2:1"), v4("10.0.0.1:2"), b"abcdef").unwrap();
        assert!(parse_packet(&packet[..packet.len() - 1]).is_none());
        assert!(parse_packet(&[]).is_none());
        assert!(parse_packet(&[0x45, 0, 0]).is_none());
    }

    #[test]
    fn test_parse_fragment_is_other() {
        let mut packet = build_udp_packet(v4("10.0.0.2:1"), v4("10.0.0.1:2"), b"abc").unwrap();
        packet[6] |= 0x20; // more fragments
        assert!(matches!(
            parse_packet(&packet),
            Some(ParsedPacket::Other { protocol: IPPROTO_UDP, .. })
        ));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "S.");
        assert_eq!(TcpFlags::RST.to_string(), "R");
    }
}
