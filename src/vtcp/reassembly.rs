//! Out-of-order segment buffer
//!
//! Holds segments that arrived ahead of `rcv_nxt` until the gap is filled.
//! Keys are offsets relative to the connection's initial receive sequence
//! number, so ordering is unaffected by 32-bit sequence wraparound.

use std::collections::BTreeMap;

/// Bounded store of future segments
#[derive(Debug, Default)]
pub struct Reassembler {
    segments: BTreeMap<u64, Vec<u8>>,
    bytes: usize,
    limit: usize,
}

impl Reassembler {
    /// Create a buffer holding at most `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            segments: BTreeMap::new(),
            bytes: 0,
            limit,
        }
    }

    /// Store a segment starting at stream offset `offset`
    ///
    /// Returns `false` if it was dropped (duplicate start or no room).
    pub fn insert(&mut self, offset: u64, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        if let Some(existing) = self.segments.get(&offset) {
            if existing.len() >= payload.len() {
                return false;
            }
        }
        let previous = self.segments.get(&offset).map_or(0, Vec::len);
        if self.bytes - previous + payload.len() > self.limit {
            return false;
        }
        self.bytes = self.bytes - previous + payload.len();
        self.segments.insert(offset, payload.to_vec());
        true
    }

    /// Remove and return bytes that continue the stream at `next`
    ///
    /// Segments entirely below `next` are discarded; overlapping ones are
    /// trimmed.
    pub fn pop_contiguous(&mut self, mut next: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((&offset, _)) = self.segments.first_key_value() {
            if offset > next {
                break;
            }
            let Some((offset, payload)) = self.segments.pop_first() else {
                break;
            };
            self.bytes -= payload.len();

            let end = offset + payload.len() as u64;
            if end <= next {
                continue;
            }
            let skip = usize::try_from(next - offset).unwrap_or(payload.len());
            out.extend_from_slice(&payload[skip..]);
            next = end;
        }
        out
    }

    /// Buffered bytes
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.segments.clear();
        self.bytes = 0;
    }
}
