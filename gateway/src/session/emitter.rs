//! Assembles engine PCM into size-bounded chunks with unit alignment.
//!
//! A chunk is cut when (a) it reaches `chunk_max_bytes` (20 ms of audio at
//! the session rate by default), (b) the synthesizing unit advances while at
//! least one whole frame is buffered, or (c) the stream is flushed. Unit
//! ranges on consecutive chunks never skip an index: units that produced no
//! audio are folded into the range of the next cut.

use bytes::Bytes;

use crate::core::audio::AudioSpec;

/// One cut chunk, ready for wire framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedChunk {
    /// Dense, 1-based within the session.
    pub chunk_seq: u64,
    /// Unit contributing the first sample (or folded-in silent units).
    pub unit_index_start: u64,
    /// Unit contributing the last sample.
    pub unit_index_end: u64,
    pub pcm: Bytes,
}

#[derive(Debug)]
pub struct ChunkEmitter {
    max_bytes: usize,
    frame_bytes: usize,
    next_chunk_seq: u64,
    /// Lowest unit index not yet covered by any emitted chunk.
    next_uncovered_unit: u64,
    buf: Vec<u8>,
    /// Unit of the first buffered byte; `None` while the buffer is empty.
    first_buffered_unit: Option<u64>,
    /// Unit of the most recently buffered byte.
    last_buffered_unit: u64,
}

impl ChunkEmitter {
    pub fn new(spec: &AudioSpec, chunk_ms: u64) -> Self {
        Self {
            max_bytes: spec.bytes_for_ms(chunk_ms),
            frame_bytes: spec.frame_bytes(),
            next_chunk_seq: 1,
            next_uncovered_unit: 0,
            buf: Vec::new(),
            first_buffered_unit: None,
            last_buffered_unit: 0,
        }
    }

    pub fn chunk_max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Feeds PCM attributed to `unit_index` and returns any chunks cut.
    pub fn push(&mut self, unit_index: u64, pcm: &[u8]) -> Vec<EmittedChunk> {
        let mut out = Vec::new();
        if pcm.is_empty() {
            return out;
        }

        // Rule (b): the unit advanced with at least one frame buffered.
        if self.first_buffered_unit.is_some()
            && unit_index > self.last_buffered_unit
            && self.buf.len() >= self.frame_bytes
        {
            out.push(self.cut(self.buf.len()));
        }

        if self.first_buffered_unit.is_none() {
            self.first_buffered_unit = Some(unit_index);
        }
        self.last_buffered_unit = unit_index;
        self.buf.extend_from_slice(pcm);

        // Rule (a): size bound.
        while self.buf.len() >= self.max_bytes {
            out.push(self.cut(self.max_bytes));
        }
        out
    }

    /// Rule (c): cuts whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<EmittedChunk> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.cut(self.buf.len()))
        }
    }

    fn cut(&mut self, len: usize) -> EmittedChunk {
        debug_assert!(len <= self.buf.len());
        let first_unit = self
            .first_buffered_unit
            .expect("cut requires a non-empty buffer");

        let rest = self.buf.split_off(len);
        let pcm = Bytes::from(std::mem::replace(&mut self.buf, rest));

        // Fold silent units between the previous cover and this audio into
        // the range, so the unit timeline never shows a gap.
        let start = self.next_uncovered_unit.min(first_unit);
        let end = self.last_buffered_unit;

        let chunk = EmittedChunk {
            chunk_seq: self.next_chunk_seq,
            unit_index_start: start,
            unit_index_end: end,
            pcm,
        };
        self.next_chunk_seq += 1;
        self.next_uncovered_unit = end + 1;
        // Anything left in the buffer belongs to the newest unit; a partial
        // cut continues that unit into the next chunk.
        self.first_buffered_unit = if self.buf.is_empty() { None } else { Some(end) };
        chunk
    }
}
