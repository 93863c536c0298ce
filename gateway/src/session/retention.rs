//! Bounded store of recently emitted chunks, replayed on resume.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// A delivered chunk kept for possible replay.
#[derive(Debug, Clone)]
pub struct RetainedChunk {
    /// Server message sequence number the chunk was originally sent with.
    pub seq: u64,
    pub chunk_seq: u64,
    pub unit_index_start: u64,
    pub unit_index_end: u64,
    pub pcm: Bytes,
    /// Present only on the first chunk of a `pcm16_wav` session.
    pub wav_header: Option<Bytes>,
    pub emitted_at: Instant,
}

/// Fixed-capacity ring of recent chunks, additionally bounded by age.
///
/// Eviction is oldest-first, so the retained chunks always form a contiguous
/// suffix of the emission order. `evicted_through_unit` remembers how far the
/// evicted prefix reached into the unit timeline; a resume cursor at or past
/// that point can still be served.
#[derive(Debug)]
pub struct RetentionRing {
    chunks: VecDeque<RetainedChunk>,
    max_chunks: usize,
    max_age: Duration,
    evicted_through_unit: Option<u64>,
}

impl RetentionRing {
    pub fn new(max_chunks: usize, max_age: Duration) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.min(64)),
            max_chunks,
            max_age,
            evicted_through_unit: None,
        }
    }

    pub fn push(&mut self, chunk: RetainedChunk) {
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.max_chunks {
            self.evict_front();
        }
        self.evict_expired(Instant::now());
    }

    /// Whether a client that confirmed everything through `last_unit_index`
    /// can be fully caught up from this ring.
    pub fn can_replay_after(&mut self, last_unit_index: u64) -> bool {
        self.evict_expired(Instant::now());
        self.evicted_through_unit
            .map_or(true, |evicted| evicted <= last_unit_index)
    }

    /// Chunks covering units beyond `last_unit_index`, in emission order.
    pub fn replay_after(&mut self, last_unit_index: u64) -> Vec<RetainedChunk> {
        self.evict_expired(Instant::now());
        self.chunks
            .iter()
            .filter(|c| c.unit_index_start > last_unit_index)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.chunks.front() {
            if now.duration_since(front.emitted_at) > self.max_age {
                self.evict_front();
            } else {
                break;
            }
        }
    }

    fn evict_front(&mut self) {
        if let Some(evicted) = self.chunks.pop_front() {
            let through = self
                .evicted_through_unit
                .map_or(evicted.unit_index_end, |prev| {
                    prev.max(evicted.unit_index_end)
                });
            self.evicted_through_unit = Some(through);
        }
    }
}
