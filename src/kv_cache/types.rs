//! Core types for the paged KV cache
//!
//! Error and result types, the block identifier, element types for sizing,
//! and the stats snapshot exposed for observability.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block identifier, an index into the pool's refcount table
pub type BlockId = u32;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("not enough free blocks: need {needed}, have {free}")]
    NoFreeBlocks { needed: usize, free: usize },
    #[error("invalid block id: {0}")]
    InvalidBlockId(BlockId),
    #[error("refcount underflow on block {0}")]
    RefCountUnderflow(BlockId),
    #[error("refcount taken on free block {0}")]
    RetainOnFreeBlock(BlockId),
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Allocation-pressure errors are handled inside the scheduler; anything
    /// else escaping the cache layer indicates a bookkeeping bug.
    pub fn is_out_of_blocks(&self) -> bool {
        matches!(self, CacheError::NoFreeBlocks { .. })
    }
}

/// Element type of the cached K/V tensors, used only for sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
}

impl DType {
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
        }
    }
}

/// Snapshot of block accounting at a point in time
///
/// `reuse_pinned_only` counts blocks held by nothing but the reuse index;
/// together with `free_blocks` and the blocks held by streams these sum to
/// the usable pool size (total minus the sentinel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub reuse_blocks: usize,
    pub reuse_pinned_only: usize,
}

impl CacheStats {
    /// Blocks currently referenced by at least one stream
    pub fn held_blocks(&self) -> usize {
        self.total_blocks - 1 - self.free_blocks - self.reuse_pinned_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F16.size_bytes(), 2);
        assert_eq!(DType::BF16.size_bytes(), 2);
        assert_eq!(DType::F32.size_bytes(), 4);
    }

    #[test]
    fn test_out_of_blocks_classification() {
        assert!(CacheError::NoFreeBlocks { needed: 2, free: 1 }.is_out_of_blocks());
        assert!(!CacheError::InvalidBlockId(3).is_out_of_blocks());
        assert!(!CacheError::RefCountUnderflow(3).is_out_of_blocks());
    }

    #[test]
    fn test_cache_stats_held() {
        let stats = CacheStats {
            total_blocks: 11,
            free_blocks: 6,
            reuse_blocks: 3,
            reuse_pinned_only: 2,
        };
        assert_eq!(stats.held_blocks(), 2);
    }
}
