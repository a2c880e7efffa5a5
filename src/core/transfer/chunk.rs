//! Chunk arithmetic and the receiver-side slot table.
//!
//! A file of `size` bytes is cut into `max(1, ceil(size / CHUNK_SIZE))`
//! chunks. Every chunk except the last is exactly [`CHUNK_SIZE`] bytes; an
//! empty file is sent as a single empty chunk.

use crate::core::config::CHUNK_SIZE;
use crate::core::error::{Result, SessionError};
use bytes::{Bytes, BytesMut};

/// Number of chunks a file of `size` bytes is split into.
///
/// Saturates at `u32::MAX`, which is far beyond any size we accept.
pub fn total_chunks(size: u64) -> u32 {
    let n = size.div_ceil(CHUNK_SIZE as u64).max(1);
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Exact payload length chunk `index` must carry for a file of `size` bytes.
pub fn expected_chunk_len(size: u64, index: u32) -> usize {
    let start = u64::from(index) * CHUNK_SIZE as u64;
    // Bounded by CHUNK_SIZE, so the cast cannot truncate.
    size.saturating_sub(start).min(CHUNK_SIZE as u64) as usize
}

/// Receiver-side storage: one slot per chunk, filled in any order.
#[derive(Debug)]
pub struct ChunkSlots {
    size: u64,
    slots: Vec<Option<Bytes>>,
    filled: u32,
}

impl ChunkSlots {
    pub fn new(size: u64) -> Self {
        let total = total_chunks(size);
        Self {
            size,
            slots: vec![None; total as usize],
            filled: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of distinct slots holding data.
    pub fn filled(&self) -> u32 {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.total()
    }

    /// Store a chunk. A duplicate index replaces the earlier payload without
    /// counting twice.
    pub fn store(&mut self, index: u32, payload: Bytes) -> Result<()> {
        let total = self.total();
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return Err(SessionError::ProtocolViolation(format!(
                "chunk index {index} out of range (total {total})"
            )));
        };

        let expected = expected_chunk_len(self.size, index);
        if payload.len() != expected {
            return Err(SessionError::ProtocolViolation(format!(
                "chunk {index} carries {} bytes, expected {expected}",
                payload.len()
            )));
        }

        if slot.replace(payload).is_none() {
            self.filled += 1;
        }
        Ok(())
    }

    /// Indexes not yet received.
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Concatenate all slots in index order. `None` until every slot is filled.
    pub fn assemble(self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.size as usize);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        Some(out.freeze())
    }
}
