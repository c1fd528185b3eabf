//! Executor handoff for one scheduling tick
//!
//! The batch carries, per stream, everything the executor needs to run the
//! step without touching scheduler state: the block table, the first KV
//! position it may write, and how many positions the step covers. The
//! executor promises to write only inside that window and to report
//! progress through the stream's own fields before the next tick.

use std::sync::Arc;

use crate::kv_cache::BlockId;
use crate::stream::{GenerateStream, StreamPhase};

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub stream: Arc<GenerateStream>,
    pub block_table: Vec<BlockId>,
    /// First KV position this step writes
    pub current_length: usize,
    /// Positions this step covers: the un-cached prompt for prefill, one
    /// for decode
    pub new_tokens: usize,
}

impl BatchEntry {
    pub fn for_stream(stream: &Arc<GenerateStream>) -> Self {
        let seq_length = stream.seq_length();
        let (current_length, new_tokens) = match stream.phase() {
            StreamPhase::Prefill => {
                let cached = stream.reuse_len();
                (cached, seq_length.saturating_sub(cached))
            }
            _ => (seq_length.saturating_sub(1), 1),
        };
        BatchEntry {
            stream: Arc::clone(stream),
            block_table: stream.blocks(),
            current_length,
            new_tokens,
        }
    }

    pub fn is_prefill(&self) -> bool {
        self.stream.phase() == StreamPhase::Prefill
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleBatch {
    pub entries: Vec<BatchEntry>,
}

impl ScheduleBatch {
    pub fn new(entries: Vec<BatchEntry>) -> Self {
        ScheduleBatch { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn streams(&self) -> impl Iterator<Item = &Arc<GenerateStream>> {
        self.entries.iter().map(|entry| &entry.stream)
    }

    /// Token positions the executor will process this step
    pub fn total_new_tokens(&self) -> usize {
        self.entries.iter().map(|entry| entry.new_tokens).sum()
    }
}
