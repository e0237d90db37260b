//! One virtual TCP connection
//!
//! Wraps a [`Tcb`] in a mutex and condvar so application threads can block
//! on it while the tunnel's receive and timer threads feed it segments.
//! Segments produced under the lock are transmitted after it is released.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::port_allocator::PortGuard;
use super::tcb::{Segment, Tcb, TcpState};
use crate::config::VirtualTcpConfig;
use crate::error::InterceptError;
use crate::packet::{build_tcp_packet, TcpHeader, TcpView};
use crate::socket::{IoMode, MsgFlags, Readiness};
use crate::tunnel::PacketSink;

/// Addresses of a connection inside the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpFlow {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl std::fmt::Display for TcpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// A reliable byte stream to the tunnel peer
pub struct VirtualTcpConnection {
    flow: TcpFlow,
    tcb: Mutex<Tcb>,
    changed: Condvar,
    sink: Arc<dyn PacketSink>,
    linger: Duration,
    _port: PortGuard,
}

impl VirtualTcpConnection {
    /// Create a closed connection on an allocated local port
    #[must_use]
    pub fn new(
        flow: TcpFlow,
        iss: u32,
        config: &VirtualTcpConfig,
        sink: Arc<dyn PacketSink>,
        port: PortGuard,
    ) -> Self {
        Self {
            flow,
            tcb: Mutex::new(Tcb::new(config, iss)),
            changed: Condvar::new(),
            sink,
            linger: config.linger(),
            _port: port,
        }
    }

    /// Local and remote tunnel addresses
    #[must_use]
    pub const fn flow(&self) -> &TcpFlow {
        &self.flow
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TcpState {
        self.tcb.lock().state()
    }

    fn emit(&self, segments: Vec<Segment>) {
        for segment in segments {
            let header = TcpHeader {
                seq: segment.seq,
                ack: segment.ack,
                flags: segment.flags,
                window: segment.window,
                mss: segment.mss,
            };
            trace!(
                "{} [{}] seq={} ack={} win={} len={}",
                self.flow,
                segment.flags,
                segment.seq,
                segment.ack,
                segment.window,
                segment.payload.len()
            );
            let packet = match build_tcp_packet(self.flow.local, self.flow.remote, &header, &segment.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Cannot build segment for {}: {}", self.flow, e);
                    continue;
                }
            };
            // Lost segments are recovered by retransmission
            if let Err(e) = self.sink.transmit(&packet) {
                debug!("Segment for {} not sent: {}", self.flow, e);
            }
        }
    }

    /// Send segments with the lock released
    fn emit_unlocked(&self, guard: &mut MutexGuard<'_, Tcb>, segments: Vec<Segment>) {
        if segments.is_empty() {
            return;
        }
        MutexGuard::unlocked(guard, || self.emit(segments));
    }

    /// Wait for a state change; returns `false` once `deadline` has passed
    fn wait(&self, guard: &mut MutexGuard<'_, Tcb>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => !self.changed.wait_until(guard, deadline).timed_out(),
            None => {
                self.changed.wait(guard);
                true
            }
        }
    }

    /// Open the connection
    ///
    /// Blocking mode waits for the handshake to finish; non-blocking mode
    /// sends SYN and returns `InProgress`.
    ///
    /// # Errors
    ///
    /// - `InProgress` for non-blocking sockets
    /// - `VirtualConnectionRefused` on RST
    /// - `VirtualConnectionTimeout` when the connect timeout elapses
    pub fn connect(&self, mode: IoMode) -> Result<(), InterceptError> {
        let mut tcb = self.tcb.lock();
        if !tcb.is_opened() {
            debug!("Virtual TCP connect {}", self.flow);
            let syn = tcb.open(Instant::now());
            self.emit_unlocked(&mut tcb, vec![syn]);
        }

        if mode.nonblocking {
            return match tcb.state() {
                TcpState::Established | TcpState::CloseWait => Ok(()),
                TcpState::SynSent => Err(InterceptError::InProgress),
                _ => Err(tcb.failure().map_or(InterceptError::NotConnected, Into::into)),
            };
        }

        loop {
            match tcb.state() {
                TcpState::Established | TcpState::CloseWait => {
                    debug!("Virtual TCP established {}", self.flow);
                    return Ok(());
                }
                TcpState::SynSent => {}
                TcpState::Closed | TcpState::FinWait => {
                    if tcb.is_released() {
                        return Err(InterceptError::SocketClosed);
                    }
                    return Err(tcb
                        .failure()
                        .map_or(InterceptError::VirtualConnectionRefused, Into::into));
                }
            }
            // The timer thread enforces the connect timeout
            self.changed.wait(&mut tcb);
        }
    }

    /// Queue bytes for transmission
    ///
    /// Blocking mode waits for the handshake, then for buffer space until
    /// everything is accepted (or the send timeout passes); non-blocking
    /// mode accepts what fits. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` while connecting or when nothing fits, if the call may
    ///   not wait
    /// - `SocketClosed` if the handle was closed
    /// - `BrokenPipe` after local shutdown, or the connection's failure
    pub fn send(&self, data: &[u8], flags: MsgFlags, mode: IoMode) -> Result<usize, InterceptError> {
        if data.is_empty() {
            return Ok(0);
        }
        let nonblocking = mode.is_nonblocking(flags);
        let deadline = mode.send_timeout.map(|t| Instant::now() + t);

        let mut tcb = self.tcb.lock();
        let mut total = 0;
        loop {
            if tcb.is_released() {
                return Err(InterceptError::SocketClosed);
            }
            if tcb.is_shut() {
                return Err(InterceptError::BrokenPipe);
            }
            if let Some(failure) = tcb.failure() {
                return if total > 0 { Ok(total) } else { Err(failure.into()) };
            }
            match tcb.state() {
                TcpState::Established | TcpState::CloseWait => {}
                TcpState::SynSent => {
                    if nonblocking || !self.wait(&mut tcb, deadline) {
                        return Err(InterceptError::WouldBlock);
                    }
                    continue;
                }
                TcpState::FinWait => return Err(InterceptError::BrokenPipe),
                TcpState::Closed => return Err(InterceptError::NotConnected),
            }

            let n = tcb.write(&data[total..]);
            if n > 0 {
                total += n;
                let segments = tcb.flush(Instant::now());
                self.emit_unlocked(&mut tcb, segments);
                if total == data.len() || nonblocking {
                    return Ok(total);
                }
            }

            if nonblocking {
                return Err(InterceptError::WouldBlock);
            }
            if !self.wait(&mut tcb, deadline) {
                return if total > 0 { Ok(total) } else { Err(InterceptError::WouldBlock) };
            }
        }
    }

    /// Read from the stream
    ///
    /// Returns 0 at end of stream. `MSG_WAITALL` keeps blocking until `buf`
    /// is full or the stream ends.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` when no data is ready and the call may not wait
    /// - `SocketClosed` if the handle was closed while waiting
    /// - `NotConnected` before a connect
    /// - the connection's failure once its data is drained
    pub fn recv(&self, buf: &mut [u8], flags: MsgFlags, mode: IoMode) -> Result<usize, InterceptError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let nonblocking = mode.is_nonblocking(flags);
        let peek = flags.contains(MsgFlags::PEEK);
        let wait_all = flags.contains(MsgFlags::WAITALL) && !peek && !nonblocking;
        let deadline = mode.recv_timeout.map(|t| Instant::now() + t);

        let mut tcb = self.tcb.lock();
        let mut total = 0;
        loop {
            if tcb.is_released() {
                return Err(InterceptError::SocketClosed);
            }

            let (n, update) = tcb.read(&mut buf[total..], peek);
            total += n;
            if let Some(update) = update {
                self.emit_unlocked(&mut tcb, vec![update]);
            }

            if total > 0 && (!wait_all || total == buf.len()) {
                return Ok(total);
            }
            if tcb.is_eof() {
                return Ok(total);
            }
            if let Some(failure) = tcb.failure() {
                return if total > 0 { Ok(total) } else { Err(failure.into()) };
            }
            if !tcb.is_opened() {
                return Err(InterceptError::NotConnected);
            }
            if nonblocking {
                return if total > 0 { Ok(total) } else { Err(InterceptError::WouldBlock) };
            }
            if !self.wait(&mut tcb, deadline) {
                return if total > 0 { Ok(total) } else { Err(InterceptError::WouldBlock) };
            }
        }
    }

    /// The handle was closed: FIN after buffered data, wake all waiters
    ///
    /// The connection keeps running in the flow table until the FIN is
    /// acknowledged, retries run out or the linger time passes.
    pub fn release(&self) {
        let mut tcb = self.tcb.lock();
        let segments = tcb.release(Instant::now(), self.linger);
        debug!("Virtual TCP {} released in {}", self.flow, tcb.state());
        drop(tcb);
        self.changed.notify_all();
        self.emit(segments);
    }

    /// `shutdown(SHUT_RDWR)` on a still open handle
    ///
    /// Queues FIN after buffered data. Readers get what already arrived and
    /// then end of stream; writers get `BrokenPipe`.
    pub fn shutdown(&self) {
        let mut tcb = self.tcb.lock();
        let segments = tcb.shutdown(Instant::now());
        debug!("Virtual TCP {} shut down in {}", self.flow, tcb.state());
        drop(tcb);
        self.changed.notify_all();
        self.emit(segments);
    }

    /// Abort with RST and wake all waiters
    pub fn abort(&self) {
        let mut tcb = self.tcb.lock();
        let rst = tcb.abort(None);
        drop(tcb);
        self.changed.notify_all();
        self.emit(rst.into_iter().collect());
    }

    /// Feed an inbound segment
    pub fn on_segment(&self, segment: &TcpView<'_>) {
        let mut tcb = self.tcb.lock();
        let replies = tcb.on_segment(segment, Instant::now());
        drop(tcb);
        self.changed.notify_all();
        self.emit(replies);
    }

    /// Timer work; returns `true` once the connection can be forgotten
    pub fn poll(&self, now: Instant) -> bool {
        let mut tcb = self.tcb.lock();
        let before = (tcb.state(), tcb.failure());
        let segments = tcb.poll(now);
        let changed = before != (tcb.state(), tcb.failure());
        let finished = tcb.is_finished();
        drop(tcb);

        if changed {
            self.changed.notify_all();
        }
        self.emit(segments);
        finished
    }

    /// Poll-style readiness
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        let tcb = self.tcb.lock();
        let failed = tcb.failure().is_some();
        let connected = matches!(tcb.state(), TcpState::Established | TcpState::CloseWait);
        Readiness {
            readable: tcb.readable() > 0 || tcb.is_eof() || failed || tcb.is_released(),
            writable: (connected && tcb.send_space() > 0) || failed || tcb.is_shut(),
            hangup: tcb.is_eof() || (tcb.is_opened() && tcb.state() == TcpState::Closed),
        }
    }
}

impl std::fmt::Debug for VirtualTcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTcpConnection")
            .field("flow", &self.flow)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
