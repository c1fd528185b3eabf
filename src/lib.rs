//! PageForge - paged KV-cache scheduling for autoregressive inference
//!
//! This crate implements the admission and memory side of a transformer
//! inference server: a reference-counted pool of paged KV-cache blocks, a
//! content-addressed prefix reuse index, per-request generation streams, and
//! a FIFO scheduler that multiplexes streams over the block pool with
//! preemption when memory runs out.
//!
//! The tensor runtime is an external collaborator: PageForge hands the
//! executor a block table per stream and observes completion through the
//! stream's own flags. No device memory is touched here.

#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow

pub mod error;
pub mod kv_cache;
pub mod logging;
pub mod scheduler;
pub mod stream;

pub use error::{ErrorCategory, PageForgeError, PageForgeResult};
pub use kv_cache::{
    BlockId, BlockPool, CacheConfig, CacheConfigCreator, CacheError, CacheManager, CacheParams,
    CacheStats, DType, ReuseIndex,
};
pub use logging::{init_logging_default, init_logging_from_env};
pub use scheduler::{
    BatchEntry, FifoScheduler, ScheduleBatch, SchedulerConfig, SchedulerError, SchedulerStats,
    STOP_REASON_CACHE_EXHAUSTED,
};
pub use stream::{GenerateConfig, GenerateInput, GenerateStream, StreamPhase};
