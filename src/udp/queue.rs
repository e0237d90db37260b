//! Per-handle inbound datagram queue (direct delivery)

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::InterceptError;

/// A decapsulated datagram and its true source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDatagram {
    pub source: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<InboundDatagram>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO of datagrams for one handle
///
/// Full queues drop the oldest datagram, the way a socket receive buffer
/// under pressure loses data rather than stalling the sender. Closing the
/// queue wakes every blocked reader with `SocketClosed`.
#[derive(Debug)]
pub struct DatagramQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl DatagramQueue {
    /// Create a queue holding at most `capacity` datagrams
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a datagram
    ///
    /// Returns `false` if the queue is closed.
    pub fn push(&self, datagram: InboundDatagram) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.items.push_back(datagram);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Copy the next datagram into `buf`
    ///
    /// Datagram boundaries are kept: bytes beyond `buf.len()` are discarded
    /// unless `peek` leaves the datagram queued.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` when empty and `nonblocking`, or when `timeout` elapses
    /// - `SocketClosed` once the queue is closed
    pub fn pop(
        &self,
        buf: &mut [u8],
        peek: bool,
        nonblocking: bool,
        timeout: Option<Duration>,
    ) -> Result<(usize, SocketAddr), InterceptError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(InterceptError::SocketClosed);
            }
            if let Some(front) = state.items.front() {
                let n = front.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&front.payload[..n]);
                let source = front.source;
                if !peek {
                    state.items.pop_front();
                }
                return Ok((n, source));
            }
            if nonblocking {
                return Err(InterceptError::WouldBlock);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() && state.items.is_empty() {
                        return Err(if state.closed {
                            InterceptError::SocketClosed
                        } else {
                            InterceptError::WouldBlock
                        });
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Close the queue and wake all readers
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.ready.notify_all();
    }

    /// Whether the queue has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued datagrams
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no datagram is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datagrams dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
