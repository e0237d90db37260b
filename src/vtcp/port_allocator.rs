//! Local port allocator for virtual TCP connections
//!
//! Hands out ports from the configured range, starting at a random offset so
//! consecutive runs do not reuse the same ports. Released ports sit in
//! TIME_WAIT before they can be handed out again, so late segments from an
//! old connection are never matched to a new one.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace, warn};

/// TIME_WAIT after release (2*MSL)
pub const PORT_TIME_WAIT: Duration = Duration::from_secs(60);

/// Thread-safe port allocator with TIME_WAIT tracking
pub struct PortAllocator {
    allocated: DashSet<u16>,
    /// port -> release timestamp
    time_wait: DashMap<u16, Instant>,
    next_port: AtomicU16,
    range: RangeInclusive<u16>,
    time_wait_duration: Duration,
}

impl PortAllocator {
    /// Create an allocator for `range`
    #[must_use]
    pub fn new(range: RangeInclusive<u16>, time_wait_duration: Duration) -> Self {
        let count = port_count(&range);
        let start = *range.start() + (rand::random::<u16>() % count.min(usize::from(u16::MAX)) as u16);

        debug!(
            "PortAllocator created: range={:?}, time_wait={:?}, start={}",
            range, time_wait_duration, start
        );

        Self {
            allocated: DashSet::new(),
            time_wait: DashMap::new(),
            next_port: AtomicU16::new(start),
            range,
            time_wait_duration,
        }
    }

    /// Allocate a port; the guard releases it into TIME_WAIT when dropped
    ///
    /// Returns `None` when every port is allocated or in TIME_WAIT.
    pub fn allocate(self: &Arc<Self>) -> Option<PortGuard> {
        self.cleanup_time_wait();

        let range_start = *self.range.start();
        let range_len = port_count(&self.range);
        let start = self.next_port.fetch_add(1, Ordering::Relaxed);

        for offset in 0..range_len {
            let port = range_start + ((usize::from(start.wrapping_sub(range_start)) + offset) % range_len) as u16;

            if self.time_wait.contains_key(&port) {
                trace!("Port {} is in TIME_WAIT, skipping", port);
                continue;
            }
            if self.allocated.insert(port) {
                trace!("Allocated port {}", port);
                return Some(PortGuard {
                    allocator: Arc::clone(self),
                    port,
                });
            }
        }

        warn!("Port exhaustion: all {} ports in use or TIME_WAIT", range_len);
        None
    }

    fn release(&self, port: u16) {
        if self.allocated.remove(&port).is_some() {
            self.time_wait.insert(port, Instant::now());
            trace!("Released port {} into TIME_WAIT", port);
        }
    }

    fn cleanup_time_wait(&self) {
        let now = Instant::now();
        let duration = self.time_wait_duration;
        self.time_wait
            .retain(|_, released_at| now.duration_since(*released_at) < duration);
    }

    /// Number of allocated ports
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Number of ports in TIME_WAIT
    #[must_use]
    pub fn time_wait_count(&self) -> usize {
        self.time_wait.len()
    }

    /// Whether `port` is allocated
    #[must_use]
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("allocated_count", &self.allocated_count())
            .field("time_wait_count", &self.time_wait_count())
            .finish()
    }
}

fn port_count(range: &RangeInclusive<u16>) -> usize {
    usize::from(*range.end()).saturating_sub(usize::from(*range.start())) + 1
}

/// An allocated port, released into TIME_WAIT on drop
pub struct PortGuard {
    allocator: Arc<PortAllocator>,
    port: u16,
}

impl PortGuard {
    /// The allocated port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl std::fmt::Debug for PortGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortGuard").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_allocate_in_range() {
        let allocator = Arc::new(PortAllocator::new(50000..=50010, PORT_TIME_WAIT));
        let guard = allocator.allocate().unwrap();
        assert!((50000..=50010).contains(&guard.port()));
        assert!(allocator.is_allocated(guard.port()));
    }

    #[test]
    fn test_drop_enters_time_wait() {
        let allocator = Arc::new(PortAllocator::new(50000..=50000, PORT_TIME_WAIT));
        let guard = allocator.allocate().unwrap();
        assert!(allocator.allocate().is_none());
        drop(guard);
        assert_eq!(allocator.allocated_count(), 0);
        assert_eq!(allocator.time_wait_count(), 1);
        assert!(allocator.allocate().is_none());
    }

    #[test]
    fn test_time_wait_expires() {
        let allocator = Arc::new(PortAllocator::new(50000..=50000, Duration::from_millis(20)));
        drop(allocator.allocate().unwrap());
        thread::sleep(Duration::from_millis(40));
        assert!(allocator.allocate().is_some());
    }

    #[test]
    fn test_exhaustion_and_uniqueness() {
        let allocator = Arc::new(PortAllocator::new(50000..=50031, PORT_TIME_WAIT));
        let guards: Vec<_> = (0..32).map(|_| allocator.allocate().unwrap()).collect();
        let ports: HashSet<u16> = guards.iter().map(PortGuard::port).collect();
        assert_eq!(ports.len(), 32);
        assert!(allocator.allocate().is_none());
    }
}
