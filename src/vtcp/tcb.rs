//! Transmission control block
//!
//! The virtual TCP state machine, free of I/O and locking. Every input (an
//! application call, an inbound segment, a timer poll) returns the segments
//! to put on the wire; the owning connection sends them after releasing its
//! lock.
//!
//! Client side only: `Closed -> SynSent -> Established -> FinWait -> Closed`,
//! with `CloseWait` once the peer has finished sending. Sequence numbers
//! compare with wrapping arithmetic throughout.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use super::reassembly::Reassembler;
use crate::config::VirtualTcpConfig;
use crate::error::InterceptError;
use crate::packet::{TcpFlags, TcpView};

/// MSS assumed when the peer's SYN-ACK carries no option (RFC 879)
const DEFAULT_PEER_MSS: u16 = 536;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    /// Our FIN is sent and not yet acknowledged
    FinWait,
    /// Peer sent FIN; reads return EOF once drained
    CloseWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN-SENT",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN-WAIT",
            Self::CloseWait => "CLOSE-WAIT",
        };
        f.write_str(name)
    }
}

/// Why a connection ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFailure {
    /// RST in answer to our SYN
    Refused,
    /// RST on an established connection
    Reset,
    /// No SYN-ACK before the connect timeout
    Timeout,
    /// Retransmission budget exhausted on an open connection
    RetriesExhausted,
}

impl From<TcpFailure> for InterceptError {
    fn from(failure: TcpFailure) -> Self {
        match failure {
            TcpFailure::Refused => Self::VirtualConnectionRefused,
            TcpFailure::Reset | TcpFailure::RetriesExhausted => Self::VirtualConnectionReset,
            TcpFailure::Timeout => Self::VirtualConnectionTimeout,
        }
    }
}

/// One outgoing segment, addressed by the owning connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// `a < b` in sequence space
#[must_use]
pub const fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
#[must_use]
pub const fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Transmission control block
#[derive(Debug)]
pub struct Tcb {
    state: TcpState,
    opened: bool,
    released: bool,
    /// `shutdown` was called: no more sends, reads end once drained
    shut: bool,
    failure: Option<TcpFailure>,

    mss: u16,
    window: u32,
    send_capacity: usize,
    recv_capacity: usize,
    initial_rto: Duration,
    max_rto: Duration,
    max_retries: u32,
    connect_timeout: Duration,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    /// Bytes from `snd_una` on: unacknowledged, then unsent
    send_buf: VecDeque<u8>,
    peer_window: u32,
    peer_mss: u16,
    fin_queued: bool,
    fin_sent: bool,

    rcv_nxt: u32,
    /// Stream offset of `rcv_nxt`
    rcv_offset: u64,
    recv_buf: VecDeque<u8>,
    reassembly: Reassembler,
    peer_fin_seq: Option<u32>,
    peer_fin: bool,
    last_advertised: u32,

    rto: Duration,
    retries: u32,
    rtx_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,
}

impl Tcb {
    /// Closed control block with initial send sequence `iss`
    #[must_use]
    pub fn new(config: &VirtualTcpConfig, iss: u32) -> Self {
        Self {
            state: TcpState::Closed,
            opened: false,
            released: false,
            shut: false,
            failure: None,
            mss: config.mss,
            window: config.window,
            send_capacity: config.send_buffer,
            recv_capacity: config.recv_buffer,
            initial_rto: config.initial_rto(),
            max_rto: config.max_rto(),
            max_retries: config.max_retries,
            connect_timeout: config.connect_timeout(),
            iss,
            snd_una: iss,
            snd_nxt: iss,
            send_buf: VecDeque::new(),
            peer_window: 0,
            peer_mss: DEFAULT_PEER_MSS,
            fin_queued: false,
            fin_sent: false,
            rcv_nxt: 0,
            rcv_offset: 0,
            recv_buf: VecDeque::new(),
            reassembly: Reassembler::new(config.recv_buffer),
            peer_fin_seq: None,
            peer_fin: false,
            last_advertised: 0,
            rto: config.initial_rto(),
            retries: 0,
            rtx_deadline: None,
            connect_deadline: None,
            linger_deadline: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TcpState {
        self.state
    }

    #[must_use]
    pub const fn failure(&self) -> Option<TcpFailure> {
        self.failure
    }

    /// Whether SYN was ever sent
    #[must_use]
    pub const fn is_opened(&self) -> bool {
        self.opened
    }

    /// Whether the owning handle has been closed
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Whether the application shut the connection down
    #[must_use]
    pub const fn is_shut(&self) -> bool {
        self.shut
    }

    /// Released and fully closed; the flow can be forgotten
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.released && self.state == TcpState::Closed
    }

    /// Peer finished sending (or we shut down) and everything was read
    #[must_use]
    pub fn is_eof(&self) -> bool {
        (self.peer_fin || self.shut) && self.recv_buf.is_empty()
    }

    /// Bytes ready to read
    #[must_use]
    pub fn readable(&self) -> usize {
        self.recv_buf.len()
    }

    /// Free space in the send buffer
    #[must_use]
    pub fn send_space(&self) -> usize {
        if self.fin_queued {
            return 0;
        }
        self.send_capacity.saturating_sub(self.send_buf.len())
    }

    /// Current retransmission timeout
    #[must_use]
    pub const fn rto(&self) -> Duration {
        self.rto
    }

    /// Retransmissions of the current earliest segment
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Start the handshake
    pub fn open(&mut self, now: Instant) -> Segment {
        self.state = TcpState::SynSent;
        self.opened = true;
        self.snd_una = self.iss;
        self.snd_nxt = self.iss.wrapping_add(1);
        self.connect_deadline = Some(now + self.connect_timeout);
        self.rtx_deadline = Some(now + self.rto);
        self.syn()
    }

    fn syn(&mut self) -> Segment {
        Segment {
            seq: self.iss,
            ack: 0,
            flags: TcpFlags::SYN,
            window: self.advertise(),
            mss: Some(self.mss),
            payload: Vec::new(),
        }
    }

    fn receive_window(&self) -> u32 {
        let free = self
            .recv_capacity
            .saturating_sub(self.recv_buf.len() + self.reassembly.bytes());
        let free = u32::try_from(free).unwrap_or(u32::MAX);
        free.min(self.window).min(u32::from(u16::MAX))
    }

    fn advertise(&mut self) -> u16 {
        let window = self.receive_window();
        self.last_advertised = window;
        u16::try_from(window).unwrap_or(u16::MAX)
    }

    fn segment(&mut self, seq: u32, flags: TcpFlags, payload: Vec<u8>) -> Segment {
        Segment {
            seq,
            ack: self.rcv_nxt,
            flags: flags | TcpFlags::ACK,
            window: self.advertise(),
            mss: None,
            payload,
        }
    }

    fn pure_ack(&mut self) -> Segment {
        self.segment(self.snd_nxt, TcpFlags::default(), Vec::new())
    }

    fn fail(&mut self, failure: TcpFailure) {
        self.failure.get_or_insert(failure);
        self.enter_closed();
    }

    fn enter_closed(&mut self) {
        self.state = TcpState::Closed;
        self.rtx_deadline = None;
        self.connect_deadline = None;
        self.send_buf.clear();
    }

    fn reset_backoff(&mut self) {
        self.rto = self.initial_rto;
        self.retries = 0;
    }

    /// Process one inbound segment
    pub fn on_segment(&mut self, seg: &TcpView<'_>, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();

        if seg.flags.contains(TcpFlags::RST) {
            self.on_reset(seg);
            return out;
        }

        match self.state {
            TcpState::Closed => {}
            TcpState::SynSent => {
                if seg.flags.contains(TcpFlags::SYN | TcpFlags::ACK) && seg.ack == self.snd_nxt {
                    self.rcv_nxt = seg.seq.wrapping_add(1);
                    self.snd_una = seg.ack;
                    self.peer_window = u32::from(seg.window);
                    self.peer_mss = seg.mss.unwrap_or(DEFAULT_PEER_MSS).min(self.mss).max(1);
                    self.state = TcpState::Established;
                    self.connect_deadline = None;
                    self.rtx_deadline = None;
                    self.reset_backoff();
                    out.push(self.pure_ack());
                    out.extend(self.flush(now));
                }
            }
            TcpState::Established | TcpState::FinWait | TcpState::CloseWait => {
                if seg.flags.contains(TcpFlags::SYN) {
                    // Retransmitted SYN-ACK: our ACK was lost
                    out.push(self.pure_ack());
                    return out;
                }
                if seg.flags.contains(TcpFlags::ACK) {
                    self.on_ack(seg.ack, seg.window, now);
                }
                let ack_needed = self.on_data(seg);
                out.extend(self.flush(now));
                if ack_needed && out.is_empty() {
                    out.push(self.pure_ack());
                }
            }
        }
        out
    }

    fn on_reset(&mut self, seg: &TcpView<'_>) {
        match self.state {
            TcpState::Closed => {}
            TcpState::SynSent => {
                if seg.flags.contains(TcpFlags::ACK) && seg.ack == self.snd_nxt {
                    debug!("Connection refused");
                    self.fail(TcpFailure::Refused);
                }
            }
            TcpState::Established | TcpState::FinWait | TcpState::CloseWait => {
                let offset = seg.seq.wrapping_sub(self.rcv_nxt);
                if offset <= self.receive_window().max(1) {
                    debug!("Connection reset in {}", self.state);
                    self.fail(TcpFailure::Reset);
                }
            }
        }
    }

    fn on_ack(&mut self, ack: u32, window: u16, now: Instant) {
        let acked = ack.wrapping_sub(self.snd_una);
        let outstanding = self.snd_nxt.wrapping_sub(self.snd_una);
        if acked > outstanding {
            return;
        }

        self.peer_window = u32::from(window);
        if acked == 0 {
            // A zero-window peer is alive, only full
            if window == 0 && outstanding > 0 {
                self.retries = 0;
            }
            return;
        }

        let fin_acked = self.fin_sent && ack == self.snd_nxt;
        let data = (acked - u32::from(fin_acked)) as usize;
        self.send_buf.drain(..data.min(self.send_buf.len()));
        self.snd_una = ack;
        self.reset_backoff();
        self.rtx_deadline = (self.snd_una != self.snd_nxt).then(|| now + self.rto);

        if fin_acked && self.state == TcpState::FinWait {
            debug!("FIN acknowledged");
            self.enter_closed();
        }
    }

    /// Accept payload/FIN; returns whether an ACK is owed
    fn on_data(&mut self, seg: &TcpView<'_>) -> bool {
        let fin = seg.flags.contains(TcpFlags::FIN);
        if seg.payload.is_empty() && !fin {
            return false;
        }
        if self.peer_fin {
            return true;
        }

        let mut seq = seg.seq;
        let mut payload = seg.payload;
        if seq_lt(seq, self.rcv_nxt) {
            let behind = self.rcv_nxt.wrapping_sub(seq) as usize;
            if behind > payload.len() || (behind == payload.len() && !fin) {
                // Duplicate
                return true;
            }
            payload = &payload[behind..];
            seq = self.rcv_nxt;
        }

        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if seq == self.rcv_nxt {
            let room = self.recv_capacity.saturating_sub(self.recv_buf.len());
            let take = payload.len().min(room);
            self.recv_buf.extend(&payload[..take]);
            self.advance(take);

            let more = self.reassembly.pop_contiguous(self.rcv_offset);
            self.recv_buf.extend(&more);
            self.advance(more.len());

            if fin && take == payload.len() {
                self.peer_fin_seq = Some(seq.wrapping_add(payload_len));
            }
        } else {
            let ahead = seq.wrapping_sub(self.rcv_nxt);
            if ahead < self.window.max(1) {
                self.reassembly.insert(self.rcv_offset + u64::from(ahead), payload);
            }
            if fin {
                self.peer_fin_seq = Some(seq.wrapping_add(payload_len));
            }
        }

        if self.peer_fin_seq == Some(self.rcv_nxt) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.peer_fin = true;
            self.peer_fin_seq = None;
            debug!("Peer finished sending");
            if self.state == TcpState::Established {
                self.state = TcpState::CloseWait;
            }
        }
        true
    }

    fn advance(&mut self, n: usize) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
        self.rcv_offset += n as u64;
    }

    /// Queue application bytes; returns how many fit
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.send_space());
        self.send_buf.extend(&data[..n]);
        n
    }

    /// Emit whatever the windows allow, then a queued FIN
    pub fn flush(&mut self, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();
        if !matches!(
            self.state,
            TcpState::Established | TcpState::FinWait | TcpState::CloseWait
        ) {
            return out;
        }

        let limit = self.window.min(self.peer_window) as usize;
        let mut in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
        let mut offset = in_flight.min(self.send_buf.len());
        let mss = usize::from(self.peer_mss);

        while offset < self.send_buf.len() {
            let room = limit.saturating_sub(in_flight);
            let len = if room > 0 {
                room.min(mss).min(self.send_buf.len() - offset)
            } else if in_flight == 0 {
                // Zero-window probe
                1
            } else {
                break;
            };

            let payload: Vec<u8> = self.send_buf.range(offset..offset + len).copied().collect();
            let seq = self.snd_nxt;
            out.push(self.segment(seq, TcpFlags::PSH, payload));
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
            offset += len;
            in_flight += len;
            if room == 0 {
                break;
            }
        }

        if self.fin_queued && !self.fin_sent && offset == self.send_buf.len() {
            let seq = self.snd_nxt;
            out.push(self.segment(seq, TcpFlags::FIN, Vec::new()));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.state = TcpState::FinWait;
        }

        if !out.is_empty() && self.rtx_deadline.is_none() {
            self.rtx_deadline = Some(now + self.rto);
        }
        out
    }

    /// Copy in-order bytes into `buf`
    ///
    /// Returns the byte count and, when the read reopened a nearly closed
    /// window, a window update to send.
    pub fn read(&mut self, buf: &mut [u8], peek: bool) -> (usize, Option<Segment>) {
        let n = buf.len().min(self.recv_buf.len());
        for (dst, src) in buf.iter_mut().zip(self.recv_buf.iter()).take(n) {
            *dst = *src;
        }
        if peek || n == 0 {
            return (n, None);
        }
        self.recv_buf.drain(..n);

        let update = self.window_update_due().then(|| self.pure_ack());
        (n, update)
    }

    fn window_update_due(&self) -> bool {
        if self.peer_fin
            || !matches!(
                self.state,
                TcpState::Established | TcpState::FinWait | TcpState::CloseWait
            )
        {
            return false;
        }
        let threshold = (u32::from(self.mss) * 2).min(self.window / 2).max(1);
        self.receive_window().saturating_sub(self.last_advertised) >= threshold
    }

    /// Queue FIN after the buffered data
    pub fn close(&mut self, now: Instant) -> Vec<Segment> {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return Vec::new();
        }
        self.fin_queued = true;
        self.flush(now)
    }

    /// Shut both directions down while the handle stays open
    ///
    /// FIN follows the buffered data; received bytes remain readable.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Segment> {
        if self.shut || self.released {
            return Vec::new();
        }
        self.shut = true;
        match self.state {
            TcpState::SynSent => self.abort(None).into_iter().collect(),
            TcpState::Established | TcpState::CloseWait => self.close(now),
            TcpState::FinWait | TcpState::Closed => Vec::new(),
        }
    }

    /// The handle is gone: FIN if connected, RST if still connecting
    pub fn release(&mut self, now: Instant, linger: Duration) -> Vec<Segment> {
        if self.released {
            return Vec::new();
        }
        self.released = true;
        self.linger_deadline = Some(now + linger);
        self.recv_buf.clear();
        self.reassembly.clear();

        match self.state {
            TcpState::SynSent => self.abort(None).into_iter().collect(),
            TcpState::Established | TcpState::CloseWait => self.close(now),
            TcpState::FinWait | TcpState::Closed => Vec::new(),
        }
    }

    /// Drop the connection, returning an RST for the peer if it knows us
    pub fn abort(&mut self, failure: Option<TcpFailure>) -> Option<Segment> {
        let rst = (self.opened && self.state != TcpState::Closed).then(|| Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            mss: None,
            payload: Vec::new(),
        });
        match failure {
            Some(failure) => self.fail(failure),
            None => self.enter_closed(),
        }
        rst
    }

    /// Timer work: connect timeout, linger expiry, retransmission
    pub fn poll(&mut self, now: Instant) -> Vec<Segment> {
        if self.state == TcpState::SynSent && self.connect_deadline.is_some_and(|d| now >= d) {
            debug!("Connect timed out");
            return self.abort(Some(TcpFailure::Timeout)).into_iter().collect();
        }
        if self.state != TcpState::Closed && self.linger_deadline.is_some_and(|d| now >= d) {
            debug!("Linger expired in {}", self.state);
            return self.abort(None).into_iter().collect();
        }

        let Some(deadline) = self.rtx_deadline else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        if self.snd_una == self.snd_nxt {
            self.rtx_deadline = None;
            return Vec::new();
        }

        self.retries += 1;
        if self.retries > self.max_retries {
            debug!("Retransmission budget of {} exhausted", self.max_retries);
            return self.abort(Some(TcpFailure::RetriesExhausted)).into_iter().collect();
        }
        self.rto = (self.rto * 2).min(self.max_rto);
        self.rtx_deadline = Some(now + self.rto);
        vec![self.earliest_unacked()]
    }

    fn earliest_unacked(&mut self) -> Segment {
        if self.state == TcpState::SynSent {
            return self.syn();
        }
        let outstanding = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
        let unacked_data = outstanding
            .saturating_sub(usize::from(self.fin_sent))
            .min(self.send_buf.len());

        if unacked_data > 0 {
            let len = unacked_data.min(usize::from(self.peer_mss));
            let payload: Vec<u8> = self.send_buf.range(..len).copied().collect();
            let seq = self.snd_una;
            self.segment(seq, TcpFlags::PSH, payload)
        } else {
            let seq = self.snd_una;
            self.segment(seq, TcpFlags::FIN, Vec::new())
        }
    }
}
