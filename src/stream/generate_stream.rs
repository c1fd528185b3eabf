//! Per-request stream state machine
//!
//! The stream is shared between three parties with disjoint write sets: the
//! client sets the stop flag to cancel, the executor advances `seq_length` /
//! generated tokens and raises the finished flag, and the scheduler owns the
//! phase and the block table. Executor-written fields are atomics read by
//! the scheduler at tick boundaries; scheduler-written fields are only
//! touched from the control thread.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::kv_cache::BlockId;

use super::input::GenerateInput;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid phase transition: {from:?} -> {to:?}")]
    InvalidPhaseTransition { from: StreamPhase, to: StreamPhase },
}

/// Lifecycle phase of a generation stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Waiting,
    Prefill,
    Decode,
    Finished,
    Stopped,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Finished | StreamPhase::Stopped)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamPhase::Waiting,
            1 => StreamPhase::Prefill,
            2 => StreamPhase::Decode,
            3 => StreamPhase::Finished,
            _ => StreamPhase::Stopped,
        }
    }
}

#[derive(Debug)]
pub struct GenerateStream {
    request_id: u64,
    input_tokens: Vec<u32>,
    max_new_tokens: usize,
    reuse_cache: AtomicBool,
    max_seq_len: AtomicUsize,

    phase: AtomicU8,
    blocks: Mutex<Vec<BlockId>>,
    reuse_len: AtomicUsize,
    fallback_count: AtomicUsize,
    /// Sequence length at the last admission; prefill covers up to here
    prefill_length: AtomicUsize,

    seq_length: AtomicUsize,
    generated: Mutex<Vec<u32>>,
    finished: AtomicBool,
    stopped: AtomicBool,
    stop_reason: Mutex<String>,
}

impl GenerateStream {
    pub fn new(input: GenerateInput) -> Self {
        let seq_length = input.input_ids.len();
        GenerateStream {
            request_id: input.request_id,
            input_tokens: input.input_ids,
            max_new_tokens: input.generate_config.max_new_tokens,
            reuse_cache: AtomicBool::new(input.generate_config.reuse_cache),
            max_seq_len: AtomicUsize::new(usize::MAX),
            phase: AtomicU8::new(StreamPhase::Waiting as u8),
            blocks: Mutex::new(Vec::new()),
            reuse_len: AtomicUsize::new(0),
            fallback_count: AtomicUsize::new(0),
            prefill_length: AtomicUsize::new(seq_length),
            seq_length: AtomicUsize::new(seq_length),
            generated: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_reason: Mutex::new(String::new()),
        }
    }

    // ---- client-facing observers ----

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn input_tokens(&self) -> &[u32] {
        &self.input_tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.input_tokens.len()
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> String {
        self.stop_reason.lock().expect("stop_reason lock").clone()
    }

    pub fn generated_tokens(&self) -> Vec<u32> {
        self.generated.lock().expect("generated lock").clone()
    }

    pub fn generated_len(&self) -> usize {
        self.generated.lock().expect("generated lock").len()
    }

    /// Prompt plus generated token ids
    pub fn token_ids(&self) -> Vec<u32> {
        let generated = self.generated.lock().expect("generated lock");
        let mut tokens = Vec::with_capacity(self.input_tokens.len() + generated.len());
        tokens.extend_from_slice(&self.input_tokens);
        tokens.extend_from_slice(&generated);
        tokens
    }

    pub fn reuse_cache(&self) -> bool {
        self.reuse_cache.load(Ordering::SeqCst)
    }

    pub fn set_reuse_cache(&self, enabled: bool) {
        self.reuse_cache.store(enabled, Ordering::SeqCst);
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len.load(Ordering::SeqCst)
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Token positions matched against the reuse index at the last admission
    pub fn reuse_len(&self) -> usize {
        self.reuse_len.load(Ordering::SeqCst)
    }

    /// Times this stream has been preempted back to the waiting queue
    pub fn fallback_count(&self) -> usize {
        self.fallback_count.load(Ordering::SeqCst)
    }

    pub fn blocks(&self) -> Vec<BlockId> {
        self.blocks.lock().expect("blocks lock").clone()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().expect("blocks lock").len()
    }

    // ---- executor hooks ----

    /// Record one generated token, advancing the sequence length
    pub fn append_token(&self, token: u32) {
        self.generated.lock().expect("generated lock").push(token);
        self.seq_length.fetch_add(1, Ordering::AcqRel);
    }

    /// Advance the sequence length without recording token ids
    pub fn advance(&self, positions: usize) {
        self.seq_length.fetch_add(positions, Ordering::AcqRel);
    }

    /// Mark the stream finished; ignored once terminal
    pub fn set_finished(&self) {
        if self.stopped() {
            return;
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Stop the stream with a reason; ignored once terminal
    pub fn set_stop(&self, reason: &str) {
        if self.finished() || self.stopped() {
            return;
        }
        *self.stop_reason.lock().expect("stop_reason lock") = reason.to_string();
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the executor has produced everything the client asked for
    pub fn reached_max_new_tokens(&self) -> bool {
        self.generated_len() >= self.max_new_tokens
    }

    // ---- scheduler-side mutation ----

    pub(crate) fn set_max_seq_len(&self, max_seq_len: usize) {
        self.max_seq_len.store(max_seq_len, Ordering::SeqCst);
    }

    pub(crate) fn set_prefill_length(&self, length: usize) {
        self.prefill_length.store(length, Ordering::SeqCst);
    }

    pub fn prefill_length(&self) -> usize {
        self.prefill_length.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reuse_len(&self, len: usize) {
        self.reuse_len.store(len, Ordering::SeqCst);
    }

    pub(crate) fn increment_fallback(&self) -> usize {
        self.fallback_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_blocks(&self, blocks: Vec<BlockId>) {
        *self.blocks.lock().expect("blocks lock") = blocks;
    }

    pub(crate) fn push_blocks(&self, new_blocks: &[BlockId]) {
        self.blocks
            .lock()
            .expect("blocks lock")
            .extend_from_slice(new_blocks);
    }

    pub(crate) fn take_blocks(&self) -> Vec<BlockId> {
        std::mem::take(&mut *self.blocks.lock().expect("blocks lock"))
    }

    /// Remove up to `count` blocks from the tail of the block table
    pub(crate) fn pop_tail_blocks(&self, count: usize) -> Vec<BlockId> {
        let mut blocks = self.blocks.lock().expect("blocks lock");
        let keep = blocks.len().saturating_sub(count);
        blocks.split_off(keep)
    }

    /// Move to `to`; transitions out of a terminal phase are a bug
    pub(crate) fn transition(&self, to: StreamPhase) -> Result<(), StreamError> {
        let from = self.phase();
        let allowed = match (from, to) {
            (StreamPhase::Waiting, StreamPhase::Prefill) => true,
            (StreamPhase::Prefill, StreamPhase::Decode) => true,
            (StreamPhase::Prefill | StreamPhase::Decode, StreamPhase::Waiting) => true,
            (from, StreamPhase::Finished | StreamPhase::Stopped) => !from.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(StreamError::InvalidPhaseTransition { from, to });
        }
        self.phase.store(to as u8, Ordering::SeqCst);
        Ok(())
    }
}
