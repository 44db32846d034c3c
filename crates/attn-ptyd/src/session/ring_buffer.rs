//! Sequenced replay buffer for session reattach.
//!
//! Stores the most recent output chunks of a session, each tagged with its
//! sequence number, so that a reconnecting client can resume exactly where
//! it left off without the daemon keeping unbounded history.

use attn_core::Chunk;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Retention limits. Eviction starts when either limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Total payload bytes to retain.
    pub max_bytes: usize,
    /// Optional cap on the number of retained chunks.
    pub max_chunks: Option<usize>,
}

impl Capacity {
    pub fn bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            max_chunks: None,
        }
    }

    pub fn chunks(max_chunks: usize) -> Self {
        Self {
            max_bytes: usize::MAX,
            max_chunks: Some(max_chunks),
        }
    }
}

/// Consistent view of the buffer taken under one lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub chunks: Vec<Chunk>,
    pub last_seq: u64,
    pub truncated: bool,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Chunk>,
    bytes: usize,
    /// Sequence number of the newest chunk ever appended (0 = none yet).
    last_seq: u64,
    truncated: bool,
}

/// A bounded FIFO of sequenced chunks.
///
/// Retained sequence numbers always form a contiguous run ending at the
/// newest chunk; eviction only ever removes the oldest entry.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: Capacity,
}

impl RingBuffer {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                bytes: 0,
                last_seq: 0,
                truncated: false,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the deque half-updated
        // in a way that breaks ordering, so keep serving after poisoning.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a chunk, returning its assigned sequence number.
    ///
    /// The newest chunk is always retained, even if it alone exceeds the
    /// byte budget.
    pub fn append(&self, data: Vec<u8>) -> u64 {
        let mut inner = self.lock();
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner.bytes += data.len();
        inner.entries.push_back(Chunk { seq, data });

        while inner.entries.len() > 1 && self.over_capacity(&inner) {
            if let Some(evicted) = inner.entries.pop_front() {
                inner.bytes -= evicted.data.len();
                inner.truncated = true;
            }
        }
        seq
    }

    fn over_capacity(&self, inner: &Inner) -> bool {
        if inner.bytes > self.capacity.max_bytes {
            return true;
        }
        matches!(self.capacity.max_chunks, Some(max) if inner.entries.len() > max)
    }

    /// Chunks strictly after `seq`.
    ///
    /// `seq == 0` replays everything retained. Returns `None` (desync) when
    /// `seq` is no longer retained or was never emitted.
    pub fn replay_since(&self, seq: u64) -> Option<Vec<Chunk>> {
        let inner = self.lock();
        Self::replay_locked(&inner, seq)
    }

    fn replay_locked(inner: &Inner, seq: u64) -> Option<Vec<Chunk>> {
        if seq == 0 {
            return Some(inner.entries.iter().cloned().collect());
        }
        let first = inner.entries.front()?.seq;
        if seq < first || seq > inner.last_seq {
            return None;
        }
        let skip = (seq - first + 1) as usize;
        Some(inner.entries.iter().skip(skip).cloned().collect())
    }

    /// Replay after `seq` together with the newest sequence number, taken
    /// atomically.
    pub fn snapshot_since(&self, seq: u64) -> Option<Snapshot> {
        let inner = self.lock();
        let chunks = Self::replay_locked(&inner, seq)?;
        Some(Snapshot {
            chunks,
            last_seq: inner.last_seq,
            truncated: inner.truncated,
        })
    }

    /// Sequence number of the newest chunk (0 if nothing was appended).
    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    /// Sequence number of the oldest retained chunk.
    pub fn first_seq(&self) -> Option<u64> {
        self.lock().entries.front().map(|c| c.seq)
    }
}

#[cfg(test)]
impl RingBuffer {
    fn bytes(&self) -> usize {
        self.lock().bytes
    }

    fn is_truncated(&self) -> bool {
        self.lock().truncated
    }
}
