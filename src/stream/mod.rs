//! Generation streams
//!
//! A `GenerateStream` is the shared handle for one generation request. The
//! client constructs it from a `GenerateInput`, the scheduler drives its
//! phase and block table, and the executor reports progress through the
//! stream's single-writer fields.

pub mod generate_stream;
pub mod input;

pub use generate_stream::{GenerateStream, StreamError, StreamPhase};
pub use input::{GenerateConfig, GenerateInput};
