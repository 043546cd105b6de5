use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::models::config::OverflowPolicy;

/// Bounded queue of muxed output between the muxer and the sink writer.
///
/// Producers (encoder output threads) never block: when the queue is over
/// capacity, whole chunks are dropped according to the overflow policy, so
/// transport-stream packets stay aligned. A chunk larger than the whole
/// capacity is still accepted when the queue is empty (MP4 trailers).
///
/// The consumer blocks in [`PacketQueue::pop`] until a chunk arrives or the
/// queue is closed and drained.
#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
    open: bool,
    stats: QueueStats,
}

/// Counters since the queue was last opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed_chunks: u64,
    pub pushed_bytes: u64,
    pub dropped_chunks: u64,
    pub dropped_bytes: u64,
}

impl PacketQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Accept chunks again, clearing leftovers and counters.
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.queued_bytes = 0;
        state.stats = QueueStats::default();
        state.open = true;
    }

    /// Stop accepting chunks and wake the consumer. Queued chunks can still be
    /// popped.
    pub fn close(&self) {
        self.state.lock().open = false;
        self.ready.notify_all();
    }

    /// Drop everything queued.
    pub fn discard(&self) {
        let mut state = self.state.lock();
        let count = state.chunks.len() as u64;
        let bytes = state.queued_bytes as u64;
        state.chunks.clear();
        state.queued_bytes = 0;
        state.stats.dropped_chunks += count;
        state.stats.dropped_bytes += bytes;
    }

    /// Queue a chunk. Returns `false` when the chunk itself was dropped.
    pub fn push(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return true;
        }

        let mut state = self.state.lock();
        if !state.open {
            state.stats.dropped_chunks += 1;
            state.stats.dropped_bytes += chunk.len() as u64;
            return false;
        }

        let fits = |state: &QueueState| {
            state.chunks.is_empty() || state.queued_bytes + chunk.len() <= self.capacity
        };

        match self.policy {
            OverflowPolicy::DropOldest => {
                while !fits(&*state) {
                    if let Some(old) = state.chunks.pop_front() {
                        state.queued_bytes -= old.len();
                        state.stats.dropped_chunks += 1;
                        state.stats.dropped_bytes += old.len() as u64;
                    }
                }
            }
            OverflowPolicy::DropNewest => {
                if !fits(&*state) {
                    state.stats.dropped_chunks += 1;
                    state.stats.dropped_bytes += chunk.len() as u64;
                    return false;
                }
            }
        }

        state.queued_bytes += chunk.len();
        state.stats.pushed_chunks += 1;
        state.stats.pushed_bytes += chunk.len() as u64;
        state.chunks.push_back(chunk);
        drop(state);

        self.ready.notify_one();
        true
    }

    /// Take the next chunk, waiting while the queue is open and empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                state.queued_bytes -= chunk.len();
                return Some(chunk);
            }
            if !state.open {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Take the next chunk without waiting.
    pub fn try_pop(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let chunk = state.chunks.pop_front()?;
        state.queued_bytes -= chunk.len();
        Some(chunk)
    }

    /// Bytes currently waiting for the sink.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
