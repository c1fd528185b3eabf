//! FIFO admission scheduling
//!
//! One `schedule()` call is one tick of the serving loop: reap terminal
//! streams, grow running caches (preempting the youngest streams when blocks
//! run out), admit waiting streams in arrival order, and emit the batch for
//! the executor.

pub mod batch;
pub mod fifo;
pub mod queue;
pub mod types;

pub use batch::{BatchEntry, ScheduleBatch};
pub use fifo::FifoScheduler;
pub use queue::SchedulerStats;
pub use types::{SchedulerConfig, SchedulerError, SchedulerResult, STOP_REASON_CACHE_EXHAUSTED};
