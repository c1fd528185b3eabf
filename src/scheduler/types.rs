//! Scheduler error and configuration types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv_cache::CacheError;
use crate::stream::StreamError;

/// Stop reason recorded on every cache-exhaustion stop.
///
/// The exact text is part of the public contract; clients and test fixtures
/// match it literally.
pub const STOP_REASON_CACHE_EXHAUSTED: &str = "can not be add input queue";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("empty prompt")]
    EmptyPrompt,
    #[error("prompt length {actual} exceeds max_seq_len {max}")]
    PromptTooLong { actual: usize, max: usize },
    #[error("cache bookkeeping error: {0}")]
    Cache(#[from] CacheError),
    #[error("stream state error: {0}")]
    Stream(#[from] StreamError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    /// Input validation errors are reported synchronously from `enqueue`;
    /// everything else aborts a `schedule` tick.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::EmptyPrompt | SchedulerError::PromptTooLong { .. }
        )
    }
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard bound on prompt plus generated length
    pub max_seq_len: usize,
    /// Allow preempting running streams when the pool is exhausted
    pub enable_fallback: bool,
    /// Preemptions a stream survives before it is stopped
    pub max_fallback_times: usize,
    /// Admission cap on concurrently running streams
    pub max_batch_size: usize,
    /// Flat block headroom withheld from admission
    pub reserve_block_num: usize,
    /// Per-running-stream block headroom withheld from admission
    pub stream_reserve_blocks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_seq_len: 8192,
            enable_fallback: false,
            max_fallback_times: 4,
            max_batch_size: 256,
            reserve_block_num: 0,
            stream_reserve_blocks: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error_classification() {
        assert!(SchedulerError::EmptyPrompt.is_input_error());
        assert!(SchedulerError::PromptTooLong { actual: 9, max: 8 }.is_input_error());
        assert!(!SchedulerError::Internal("bug".to_string()).is_input_error());
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_seq_len, 8192);
        assert!(!config.enable_fallback);
        assert_eq!(config.reserve_block_num, 0);
        assert_eq!(config.stream_reserve_blocks, 0);
    }

    #[test]
    fn test_stop_reason_literal() {
        assert_eq!(STOP_REASON_CACHE_EXHAUSTED, "can not be add input queue");
    }
}
