//! FIFO scheduler over the paged KV cache
//!
//! Streams advance strictly in arrival order. Each `schedule()` tick runs
//! four passes:
//!
//! 1. reap terminal streams and release their cache,
//! 2. cover the running set's next-step block deficit, taking blocks from
//!    the youngest streams when fallback is enabled, then grow every stream
//!    that crossed a block boundary,
//! 3. admit waiting streams while the head fits,
//! 4. emit the batch for the executor.
//!
//! A preempted stream keeps its tokens and re-enters prefill from the front
//! of the waiting queue, so arrival order is preserved across preemption. A
//! stream that cannot be satisfied at all is stopped with the canonical
//! reason string.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::kv_cache::{CacheManager, CacheStats};
use crate::stream::{GenerateStream, StreamPhase};

use super::batch::{BatchEntry, ScheduleBatch};
use super::queue::SchedulerStats;
use super::types::{
    SchedulerConfig, SchedulerError, SchedulerResult, STOP_REASON_CACHE_EXHAUSTED,
};

#[derive(Debug)]
pub struct FifoScheduler {
    config: SchedulerConfig,
    cache: CacheManager,
    waiting: VecDeque<Arc<GenerateStream>>,
    running: VecDeque<Arc<GenerateStream>>,
}

impl FifoScheduler {
    pub fn new(config: SchedulerConfig, cache: CacheManager) -> Self {
        FifoScheduler {
            config,
            cache,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
        }
    }

    /// Append a stream to the waiting queue.
    ///
    /// Only validates the input; no cache is touched until admission.
    pub fn enqueue(&mut self, stream: Arc<GenerateStream>) -> SchedulerResult<()> {
        if stream.prompt_len() == 0 {
            return Err(SchedulerError::EmptyPrompt);
        }
        if stream.prompt_len() > self.config.max_seq_len {
            return Err(SchedulerError::PromptTooLong {
                actual: stream.prompt_len(),
                max: self.config.max_seq_len,
            });
        }
        stream.set_max_seq_len(self.config.max_seq_len);
        debug!(request_id = stream.request_id(), "stream enqueued");
        self.waiting.push_back(stream);
        Ok(())
    }

    /// One tick of the serving loop
    pub fn schedule(&mut self) -> SchedulerResult<ScheduleBatch> {
        self.sweep_terminal()?;
        self.evaluate_running()?;
        self.admit_waiting()?;
        Ok(self.emit_batch())
    }

    pub fn waiting_streams_size(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_streams_size(&self) -> usize {
        self.running.len()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        SchedulerStats {
            waiting_streams: self.waiting.len(),
            running_streams: self.running.len(),
        }
    }

    pub fn free_block_count(&self) -> usize {
        self.cache.free_block_count()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.cache_stats()
    }

    /// Request ids currently waiting, head first
    pub fn waiting_request_ids(&self) -> Vec<u64> {
        self.waiting.iter().map(|s| s.request_id()).collect()
    }

    // ---- tick passes ----

    /// Release and drop every stream that reached a terminal state
    fn sweep_terminal(&mut self) -> SchedulerResult<()> {
        for stream in &self.running {
            if !stream.finished() && !stream.stopped() && stream.reached_max_new_tokens() {
                stream.set_finished();
            }
        }

        let mut kept = VecDeque::with_capacity(self.running.len());
        for stream in std::mem::take(&mut self.running) {
            if stream.finished() || stream.stopped() {
                self.finalize(&stream)?;
            } else {
                kept.push_back(stream);
            }
        }
        self.running = kept;

        // Waiting streams can only become terminal through client
        // cancellation; they hold no cache.
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for stream in std::mem::take(&mut self.waiting) {
            if stream.finished() || stream.stopped() {
                self.finalize(&stream)?;
            } else {
                kept.push_back(stream);
            }
        }
        self.waiting = kept;
        Ok(())
    }

    fn finalize(&mut self, stream: &Arc<GenerateStream>) -> SchedulerResult<()> {
        let clean = stream.finished();
        if !stream.phase().is_terminal() {
            stream.transition(if clean {
                StreamPhase::Finished
            } else {
                StreamPhase::Stopped
            })?;
        }
        self.cache.release_stream(stream, clean)?;
        debug!(
            request_id = stream.request_id(),
            finished = clean,
            reason = %stream.stop_reason(),
            "stream reaped"
        );
        Ok(())
    }

    /// Cover the next-step block deficit, then grow streams across block
    /// boundaries
    fn evaluate_running(&mut self) -> SchedulerResult<()> {
        if self.running.is_empty() {
            return Ok(());
        }

        for stream in &self.running {
            // The executor produced the first token past the admitted
            // prefill window: the stream is decoding now.
            if stream.phase() == StreamPhase::Prefill
                && stream.seq_length() > stream.prefill_length()
            {
                stream.transition(StreamPhase::Decode)?;
            }
            if stream.seq_length() > self.config.max_seq_len {
                stream.set_stop("sequence length exceeds max_seq_len");
            }
        }

        if self.config.enable_fallback {
            self.cover_deficit()?;
        }

        let streams: Vec<Arc<GenerateStream>> = self.running.iter().cloned().collect();
        for stream in streams {
            if stream.finished() || stream.stopped() {
                continue;
            }
            if self.cache.next_block_need(&stream) == 0 {
                continue;
            }
            match self.cache.grow_stream(&stream) {
                Ok(()) => {}
                Err(error) if error.is_out_of_blocks() => {
                    warn!(
                        request_id = stream.request_id(),
                        seq_length = stream.seq_length(),
                        "stopping stream, cache exhausted during decode"
                    );
                    stream.set_stop(STOP_REASON_CACHE_EXHAUSTED);
                    stream.transition(StreamPhase::Stopped)?;
                    // Remaining blocks are reclaimed by the next sweep.
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Take blocks from the youngest running streams until the next step's
    /// total need fits in the free list.
    ///
    /// A victim drained of its whole table is preempted back to the waiting
    /// queue; a victim that only gives up its tail stays running and fails
    /// its own growth in this tick.
    fn cover_deficit(&mut self) -> SchedulerResult<()> {
        loop {
            let deficit: usize = self
                .running
                .iter()
                .filter(|s| !s.finished() && !s.stopped())
                .map(|s| self.cache.next_block_need(s))
                .sum();
            let free = self.cache.free_block_count();
            if deficit <= free {
                return Ok(());
            }

            let Some(victim) = self.running.back().cloned() else {
                return Ok(());
            };
            let held = victim.block_count();
            if held == 0 {
                return Ok(());
            }

            let take = deficit - free;
            if take >= held {
                self.running.pop_back();
                self.preempt(&victim)?;
            } else {
                self.cache.release_tail_blocks(&victim, take)?;
                return Ok(());
            }
        }
    }

    fn preempt(&mut self, victim: &Arc<GenerateStream>) -> SchedulerResult<()> {
        // Full blocks go back to the reuse index first so a re-admitted
        // stream can recover its prefix.
        self.cache.release_stream(victim, true)?;

        let fallback_count = victim.increment_fallback();
        if fallback_count > self.config.max_fallback_times {
            warn!(
                request_id = victim.request_id(),
                fallback_count, "stream exceeded fallback bound, stopping"
            );
            victim.set_stop(STOP_REASON_CACHE_EXHAUSTED);
            victim.transition(StreamPhase::Stopped)?;
            return Ok(());
        }

        warn!(
            request_id = victim.request_id(),
            fallback_count, "preempting youngest stream"
        );
        victim.transition(StreamPhase::Waiting)?;
        self.waiting.push_front(Arc::clone(victim));
        Ok(())
    }

    /// Admit from the head of the waiting queue while it fits
    fn admit_waiting(&mut self) -> SchedulerResult<()> {
        while let Some(head) = self.waiting.front().cloned() {
            if self.running.len() >= self.config.max_batch_size {
                break;
            }
            let reserve = self.config.reserve_block_num
                + self.running.len() * self.config.stream_reserve_blocks;

            match self.cache.init_stream_cache(&head, reserve) {
                Ok(()) => {
                    head.set_prefill_length(head.seq_length());
                    head.transition(StreamPhase::Prefill)?;
                    self.waiting.pop_front();
                    debug!(
                        request_id = head.request_id(),
                        blocks = head.block_count(),
                        reused_tokens = head.reuse_len(),
                        "stream admitted"
                    );
                    self.running.push_back(head);
                }
                Err(error) if error.is_out_of_blocks() => {
                    if self.running.is_empty() {
                        // Nothing is running and the head still does not
                        // fit: it never will.
                        warn!(
                            request_id = head.request_id(),
                            prompt_len = head.prompt_len(),
                            "stopping stream, prompt cannot fit in cache"
                        );
                        head.set_stop(STOP_REASON_CACHE_EXHAUSTED);
                        head.transition(StreamPhase::Stopped)?;
                        self.cache.release_stream(&head, false)?;
                        self.waiting.pop_front();
                        continue;
                    }
                    // Preserve FIFO: no head-of-line bypass.
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Batch of live running streams, admission order
    fn emit_batch(&self) -> ScheduleBatch {
        let entries = self
            .running
            .iter()
            .filter(|s| !s.finished() && !s.stopped())
            .map(BatchEntry::for_stream)
            .collect();
        ScheduleBatch::new(entries)
    }
}
