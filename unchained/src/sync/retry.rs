//! Retry passes over failed chunks.

use crate::chunk::BlockRange;
use crate::manifest::ChunkRecord;

pub const DEFAULT_RETRY_PASSES: u32 = 3;

/// Retry bookkeeping for one pipeline.
///
/// Starts from the planned chunks. Only a commit removes a chunk from the
/// pending set, so a chunk that failed or was cut short by cancellation stays
/// pending, and nothing outside the plan is ever added.
#[derive(Debug, Clone)]
pub struct RetryState {
    remaining: u32,
    pending: Vec<ChunkRecord>,
}

impl RetryState {
    pub fn new(passes: u32, planned: Vec<ChunkRecord>) -> Self {
        Self {
            remaining: passes,
            pending: planned,
        }
    }

    /// Drops the chunks the pass that just ran committed.
    pub fn record_pass(&mut self, committed: &[BlockRange]) {
        self.pending.retain(|chunk| !committed.contains(&chunk.range));
    }

    /// Next batch to retry, or `None` when done or out of passes.
    pub fn next_pass(&mut self) -> Option<Vec<ChunkRecord>> {
        if self.pending.is_empty() || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.pending.clone())
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn pending(&self) -> &[ChunkRecord] {
        &self.pending
    }

    /// Chunks that never committed.
    pub fn into_failed(self) -> Vec<ChunkRecord> {
        self.pending
    }
}
