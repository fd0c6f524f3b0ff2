//! Chunked payload distribution.
//!
//! Payloads above the inline limit move over the chunk stream protocol in
//! fixed 64 KiB pieces. A download is a bitmap of received chunks plus a
//! per-chunk availability count across serving peers; the next chunk to
//! fetch is always the rarest one we still need, so a partially-seeded
//! payload spreads before common chunks are duplicated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use taskmesh_core::canonical::sha256_hex;
use taskmesh_core::constants::{BACKOFF_INITIAL_MS, BACKOFF_MAX_MS, CHUNK_SIZE, INLINE_PAYLOAD_LIMIT};
use taskmesh_core::types::TaskHash;

/// Whether a payload of this size is gossiped inline or chunked.
pub fn is_inline(payload_size: usize) -> bool {
    payload_size <= INLINE_PAYLOAD_LIMIT
}

/// Number of chunks for a payload of the given size.
pub fn chunk_count(payload_size: usize) -> usize {
    payload_size.div_ceil(CHUNK_SIZE)
}

/// Split a payload into chunks for serving.
pub fn split_chunks(payload: &[u8]) -> Vec<&[u8]> {
    payload.chunks(CHUNK_SIZE).collect()
}

/// The byte range of one chunk.
pub fn chunk_of(payload: &[u8], index: usize) -> Option<&[u8]> {
    payload.chunks(CHUNK_SIZE).nth(index)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("Chunk {index} has wrong size: got {got}, expected {expected}")]
    WrongSize { index: usize, got: usize, expected: usize },

    #[error("Assembled payload hash mismatch for task {0}")]
    HashMismatch(TaskHash),

    #[error("Download incomplete: {have}/{total} chunks")]
    Incomplete { have: usize, total: usize },
}

/// Resumable download state for one task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTracker {
    pub task_hash: TaskHash,
    payload_size: usize,
    payload_hash: String,
    /// Received chunk bytes, by index. Doubles as the resume bitmap.
    chunks: HashMap<usize, Vec<u8>>,
    /// How many known peers hold each chunk.
    availability: Vec<usize>,
}

impl ChunkTracker {
    pub fn new(task_hash: &str, payload_size: usize, payload_hash: &str) -> Self {
        let total = chunk_count(payload_size);
        Self {
            task_hash: task_hash.to_string(),
            payload_size,
            payload_hash: payload_hash.to_string(),
            chunks: HashMap::new(),
            availability: vec![0; total],
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.availability.len()
    }

    pub fn have_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks()
    }

    pub fn has_chunk(&self, index: usize) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Expected byte length of a chunk.
    fn expected_len(&self, index: usize) -> usize {
        if index + 1 == self.total_chunks() && self.payload_size % CHUNK_SIZE != 0 {
            self.payload_size % CHUNK_SIZE
        } else {
            CHUNK_SIZE
        }
    }

    /// Record that a peer advertises holding a chunk.
    pub fn record_availability(&mut self, index: usize) -> Result<(), ChunkError> {
        if index >= self.total_chunks() {
            return Err(ChunkError::IndexOutOfRange { index, total: self.total_chunks() });
        }
        self.availability[index] += 1;
        Ok(())
    }

    /// A full serving peer holds every chunk.
    pub fn record_full_peer(&mut self) {
        for count in &mut self.availability {
            *count += 1;
        }
    }

    /// The rarest chunk we still need; ties go to the lower index.
    pub fn next_needed(&self) -> Option<usize> {
        (0..self.total_chunks())
            .filter(|i| !self.chunks.contains_key(i))
            .min_by_key(|i| (self.availability[*i], *i))
    }

    /// Accept a received chunk. Size is validated per index; content is
    /// validated against the payload hash at assembly.
    pub fn accept(&mut self, index: usize, data: Vec<u8>) -> Result<(), ChunkError> {
        let total = self.total_chunks();
        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }
        let expected = self.expected_len(index);
        if data.len() != expected {
            return Err(ChunkError::WrongSize { index, got: data.len(), expected });
        }
        if self.chunks.insert(index, data).is_none() {
            debug!(task = %self.task_hash, index, have = self.chunks.len(), total,
                   "Chunk accepted");
        }
        Ok(())
    }

    /// Assemble and verify the full payload once every chunk is present.
    pub fn assemble(&self) -> Result<Vec<u8>, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                have: self.chunks.len(),
                total: self.total_chunks(),
            });
        }
        let mut payload = Vec::with_capacity(self.payload_size);
        for index in 0..self.total_chunks() {
            payload.extend_from_slice(&self.chunks[&index]);
        }
        if sha256_hex(&payload) != self.payload_hash {
            return Err(ChunkError::HashMismatch(self.task_hash.clone()));
        }
        Ok(payload)
    }
}

/// Pick which serving peer to ask for a chunk, spreading load round-robin
/// over the request count.
pub fn pick_peer<T>(peers: &[T], request_seq: usize) -> Option<&T> {
    if peers.is_empty() {
        return None;
    }
    Some(&peers[request_seq % peers.len()])
}

/// Exponential backoff for retrying failed network operations, such as a
/// provider query that came back empty.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_ms: i64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current_ms: BACKOFF_INITIAL_MS }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next attempt, doubling up to the cap.
    pub fn next_delay_ms(&mut self) -> i64 {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms * 2).min(BACKOFF_MAX_MS);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = BACKOFF_INITIAL_MS;
    }
}
