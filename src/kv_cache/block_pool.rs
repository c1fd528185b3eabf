//! Fixed pool of reference-counted KV-cache blocks
//!
//! The pool hands out block ids from a free list and tracks a refcount per
//! block so streams and the reuse index can share blocks. Block 0 is
//! reserved as the sentinel and never enters circulation: a pool configured
//! with `N` blocks reports `N - 1` free at startup.

use std::collections::VecDeque;

use super::types::{BlockId, CacheError, CacheResult};

#[derive(Debug)]
pub struct BlockPool {
    ref_counts: Vec<u32>,
    free_list: VecDeque<BlockId>,
}

impl BlockPool {
    /// Create a pool of `block_count` blocks, ids `[0, block_count)`.
    /// Id 0 is the sentinel and is withheld from the free list.
    pub fn new(block_count: usize) -> Self {
        BlockPool {
            ref_counts: vec![0; block_count],
            free_list: (1..block_count as BlockId).collect(),
        }
    }

    /// Pop `count` blocks from the free list, each with refcount 1.
    ///
    /// Atomic: on failure nothing is mutated.
    pub fn allocate(&mut self, count: usize) -> CacheResult<Vec<BlockId>> {
        if self.free_list.len() < count {
            return Err(CacheError::NoFreeBlocks {
                needed: count,
                free: self.free_list.len(),
            });
        }

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self
                .free_list
                .pop_front()
                .expect("free list length checked above");
            self.ref_counts[id as usize] = 1;
            blocks.push(id);
        }
        Ok(blocks)
    }

    /// Add a reference to a block already held by at least one owner
    pub fn retain(&mut self, id: BlockId) -> CacheResult<()> {
        let count = self.slot_mut(id)?;
        if *count == 0 {
            return Err(CacheError::RetainOnFreeBlock(id));
        }
        *count += 1;
        Ok(())
    }

    /// Drop a reference; the block returns to the free list at zero
    pub fn release(&mut self, id: BlockId) -> CacheResult<()> {
        let count = self.slot_mut(id)?;
        if *count == 0 {
            return Err(CacheError::RefCountUnderflow(id));
        }
        *count -= 1;
        if *count == 0 {
            self.free_list.push_back(id);
        }
        Ok(())
    }

    pub fn ref_count(&self, id: BlockId) -> CacheResult<u32> {
        self.ref_counts
            .get(id as usize)
            .copied()
            .ok_or(CacheError::InvalidBlockId(id))
    }

    pub fn free_block_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.ref_counts.len()
    }

    fn slot_mut(&mut self, id: BlockId) -> CacheResult<&mut u32> {
        if id == 0 {
            // The sentinel is never a legal owner target.
            return Err(CacheError::InvalidBlockId(id));
        }
        self.ref_counts
            .get_mut(id as usize)
            .ok_or(CacheError::InvalidBlockId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserves_sentinel() {
        let pool = BlockPool::new(4);
        assert_eq!(pool.total_blocks(), 4);
        assert_eq!(pool.free_block_count(), 3);
    }

    #[test]
    fn test_allocate_and_release() {
        let mut pool = BlockPool::new(4);
        let blocks = pool.allocate(2).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(pool.free_block_count(), 1);
        for &b in &blocks {
            assert_eq!(pool.ref_count(b).unwrap(), 1);
        }

        for b in blocks {
            pool.release(b).unwrap();
        }
        assert_eq!(pool.free_block_count(), 3);
    }

    #[test]
    fn test_allocate_is_atomic() {
        let mut pool = BlockPool::new(3);
        let result = pool.allocate(3);
        assert!(matches!(
            result,
            Err(CacheError::NoFreeBlocks { needed: 3, free: 2 })
        ));
        // Nothing leaked out of the failed request.
        assert_eq!(pool.free_block_count(), 2);
    }

    #[test]
    fn test_sentinel_never_allocated() {
        let mut pool = BlockPool::new(4);
        let blocks = pool.allocate(3).unwrap();
        assert!(!blocks.contains(&0));
        assert!(pool.allocate(1).is_err());
    }

    #[test]
    fn test_retain_shares_block() {
        let mut pool = BlockPool::new(4);
        let b = pool.allocate(1).unwrap()[0];
        pool.retain(b).unwrap();
        assert_eq!(pool.ref_count(b).unwrap(), 2);

        pool.release(b).unwrap();
        // Still held by the second owner.
        assert_eq!(pool.free_block_count(), 2);
        pool.release(b).unwrap();
        assert_eq!(pool.free_block_count(), 3);
    }

    #[test]
    fn test_release_underflow() {
        let mut pool = BlockPool::new(4);
        let b = pool.allocate(1).unwrap()[0];
        pool.release(b).unwrap();
        assert!(matches!(
            pool.release(b),
            Err(CacheError::RefCountUnderflow(_))
        ));
    }

    #[test]
    fn test_retain_on_free_block() {
        let mut pool = BlockPool::new(4);
        assert!(matches!(
            pool.retain(2),
            Err(CacheError::RetainOnFreeBlock(2))
        ));
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let mut pool = BlockPool::new(4);
        assert!(matches!(pool.release(9), Err(CacheError::InvalidBlockId(9))));
        assert!(matches!(pool.retain(0), Err(CacheError::InvalidBlockId(0))));
    }
}
