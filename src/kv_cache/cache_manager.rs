//! Per-stream cache bookkeeping
//!
//! The manager owns the block pool and the reuse index and performs every
//! allocation on behalf of generation streams: initial prefill allocation
//! (with prefix reuse), decode-time growth, fallback tail release, and the
//! final release that optionally publishes full blocks back to the index.
//!
//! Allocation pressure is absorbed in two stages: first the reuse index is
//! drained LRU-entry by LRU-entry, then the request fails with
//! `NoFreeBlocks` and the caller decides between preemption and stopping.

use tracing::debug;

use crate::stream::GenerateStream;

use super::block_pool::BlockPool;
use super::config::CacheConfig;
use super::reuse_index::ReuseIndex;
use super::types::{CacheError, CacheResult, CacheStats};

#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    pool: BlockPool,
    reuse: ReuseIndex,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let pool = BlockPool::new(config.block_count);
        let reuse = ReuseIndex::new(config.block_token_count);
        CacheManager {
            config,
            pool,
            reuse,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn block_token_count(&self) -> usize {
        self.config.block_token_count
    }

    pub fn free_block_count(&self) -> usize {
        self.pool.free_block_count()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            total_blocks: self.pool.total_blocks(),
            free_blocks: self.pool.free_block_count(),
            reuse_blocks: self.reuse.block_count(),
            reuse_pinned_only: self.reuse.pinned_only_count(&self.pool),
        }
    }

    /// Blocks needed to back `token_count` positions
    pub fn blocks_for_tokens(&self, token_count: usize) -> usize {
        (token_count + self.config.block_token_count - 1) / self.config.block_token_count
    }

    /// Additional blocks a stream needs before its next step
    pub fn next_block_need(&self, stream: &GenerateStream) -> usize {
        self.blocks_for_tokens(stream.seq_length())
            .saturating_sub(stream.block_count())
    }

    /// Allocate the full block table for a stream entering prefill.
    ///
    /// `reserve` blocks are kept back as headroom for in-flight streams.
    /// With reuse enabled the prompt is first matched against the index; a
    /// match covering the whole sequence is trimmed by one block so prefill
    /// always has at least one token to compute. On failure any matched
    /// blocks are released and the stream is left untouched.
    pub fn init_stream_cache(&mut self, stream: &GenerateStream, reserve: usize) -> CacheResult<()> {
        let seq_length = stream.seq_length();
        let required = self.blocks_for_tokens(seq_length);

        let mut reused = Vec::new();
        let mut matched = 0;
        if stream.reuse_cache() {
            let tokens = stream.token_ids();
            let usable = tokens.len().min(seq_length);
            (reused, matched) = self.reuse.try_match(&tokens[..usable], &mut self.pool)?;
            if matched >= seq_length && !reused.is_empty() {
                let trimmed = reused.pop().expect("non-empty checked above");
                self.pool.release(trimmed)?;
                matched -= self.config.block_token_count;
            }
        }

        let needed = required - reused.len();
        if !self.ensure_free(needed + reserve)? {
            let free = self.pool.free_block_count();
            for block in reused {
                self.pool.release(block)?;
            }
            return Err(CacheError::NoFreeBlocks {
                needed: needed + reserve,
                free,
            });
        }

        let mut blocks = reused;
        blocks.extend(self.pool.allocate(needed)?);
        debug!(
            request_id = stream.request_id(),
            blocks = blocks.len(),
            reused_tokens = matched,
            "initialized stream cache"
        );
        stream.set_reuse_len(matched);
        stream.set_blocks(blocks);
        Ok(())
    }

    /// Extend a running stream's block table across a block boundary
    pub fn grow_stream(&mut self, stream: &GenerateStream) -> CacheResult<()> {
        let deficit = self.next_block_need(stream);
        if deficit == 0 {
            return Ok(());
        }
        if !self.ensure_free(deficit)? {
            return Err(CacheError::NoFreeBlocks {
                needed: deficit,
                free: self.pool.free_block_count(),
            });
        }
        let new_blocks = self.pool.allocate(deficit)?;
        stream.push_blocks(&new_blocks);
        Ok(())
    }

    /// Release everything a stream holds.
    ///
    /// With `publish` set and reuse enabled on the stream, full blocks are
    /// handed to the reuse index instead of the free list; the trailing
    /// partial block is always freed.
    pub fn release_stream(&mut self, stream: &GenerateStream, publish: bool) -> CacheResult<()> {
        let blocks = stream.take_blocks();
        stream.set_reuse_len(0);
        if blocks.is_empty() {
            return Ok(());
        }

        if publish && stream.reuse_cache() {
            let tokens = stream.token_ids();
            let covered = tokens.len().min(stream.seq_length());
            let full = (covered / self.config.block_token_count).min(blocks.len());
            let published_tokens = full * self.config.block_token_count;
            self.reuse
                .publish(&tokens[..published_tokens], &blocks[..full], &mut self.pool)?;
            for &block in &blocks[full..] {
                self.pool.release(block)?;
            }
        } else {
            for block in blocks {
                self.pool.release(block)?;
            }
        }
        debug!(request_id = stream.request_id(), "released stream cache");
        Ok(())
    }

    /// Take up to `count` blocks from the tail of a fallback victim
    pub fn release_tail_blocks(
        &mut self,
        stream: &GenerateStream,
        count: usize,
    ) -> CacheResult<usize> {
        let popped = stream.pop_tail_blocks(count);
        let released = popped.len();
        for block in popped {
            self.pool.release(block)?;
        }
        Ok(released)
    }

    /// Evict reuse entries until `needed` blocks are free; false when the
    /// index runs dry first
    fn ensure_free(&mut self, needed: usize) -> CacheResult<bool> {
        while self.pool.free_block_count() < needed {
            if self.reuse.evict_lru(&mut self.pool)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::types::DType;
    use crate::stream::{GenerateConfig, GenerateInput};

    fn manager(block_count: usize, block_token_count: usize) -> CacheManager {
        let config =
            CacheConfig::new(block_count, block_token_count, 1, 1, 4, DType::F16).unwrap();
        CacheManager::new(config)
    }

    fn stream(tokens: Vec<u32>, reuse: bool) -> GenerateStream {
        let input = GenerateInput::new(0, tokens).with_config(GenerateConfig {
            max_new_tokens: usize::MAX,
            reuse_cache: reuse,
        });
        GenerateStream::new(input)
    }

    #[test]
    fn test_init_allocates_ceiling_blocks() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3], false);
        manager.init_stream_cache(&s, 0).unwrap();
        assert_eq!(s.block_count(), 2);
        assert_eq!(manager.free_block_count(), 5);
    }

    #[test]
    fn test_init_failure_leaves_stream_untouched() {
        let mut manager = manager(3, 2);
        let s = stream(vec![1, 2, 3, 4, 5, 6], false);
        let result = manager.init_stream_cache(&s, 0);
        assert!(matches!(result, Err(CacheError::NoFreeBlocks { .. })));
        assert_eq!(s.block_count(), 0);
        assert_eq!(manager.free_block_count(), 2);
    }

    #[test]
    fn test_init_respects_reserve() {
        let mut manager = manager(4, 2);
        let s = stream(vec![1, 2, 3, 4], false);
        // Two blocks needed, three free, but two held back.
        assert!(manager.init_stream_cache(&s, 2).is_err());
        manager.init_stream_cache(&s, 1).unwrap();
        assert_eq!(manager.free_block_count(), 1);
    }

    #[test]
    fn test_grow_on_block_boundary() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3, 4], false);
        manager.init_stream_cache(&s, 0).unwrap();
        assert_eq!(manager.next_block_need(&s), 0);

        s.advance(1);
        assert_eq!(manager.next_block_need(&s), 1);
        manager.grow_stream(&s).unwrap();
        assert_eq!(s.block_count(), 3);
        assert_eq!(manager.next_block_need(&s), 0);
    }

    #[test]
    fn test_release_returns_blocks() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3], false);
        manager.init_stream_cache(&s, 0).unwrap();
        manager.release_stream(&s, false).unwrap();
        assert_eq!(s.block_count(), 0);
        assert_eq!(manager.free_block_count(), 7);
    }

    #[test]
    fn test_release_publishes_full_blocks() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3, 4, 5], true);
        manager.init_stream_cache(&s, 0).unwrap();
        assert_eq!(manager.free_block_count(), 4);

        manager.release_stream(&s, true).unwrap();
        // Two full blocks stay pinned by the index, the partial one is freed.
        assert_eq!(manager.free_block_count(), 5);
        let stats = manager.cache_stats();
        assert_eq!(stats.reuse_blocks, 2);
        assert_eq!(stats.reuse_pinned_only, 2);
    }

    #[test]
    fn test_second_stream_reuses_prefix() {
        let mut manager = manager(8, 2);
        let first = stream(vec![1, 2, 3, 4, 5], true);
        manager.init_stream_cache(&first, 0).unwrap();
        manager.release_stream(&first, true).unwrap();

        let second = stream(vec![1, 2, 3, 4, 5, 6, 7], true);
        manager.init_stream_cache(&second, 0).unwrap();
        assert_eq!(second.reuse_len(), 4);
        assert_eq!(second.block_count(), 4);
        // Only two fresh blocks were taken.
        assert_eq!(manager.free_block_count(), 3);
    }

    #[test]
    fn test_full_prompt_match_trimmed() {
        let mut manager = manager(8, 2);
        let first = stream(vec![1, 2, 3, 4], true);
        manager.init_stream_cache(&first, 0).unwrap();
        manager.release_stream(&first, true).unwrap();

        // Identical prompt: the match would cover everything, so one block
        // is recomputed to give prefill work to do.
        let second = stream(vec![1, 2, 3, 4], true);
        manager.init_stream_cache(&second, 0).unwrap();
        assert_eq!(second.reuse_len(), 2);
        assert_eq!(second.block_count(), 2);
    }

    #[test]
    fn test_allocation_evicts_reuse_entries() {
        let mut manager = manager(4, 2);
        let first = stream(vec![1, 2, 3, 4], true);
        manager.init_stream_cache(&first, 0).unwrap();
        manager.release_stream(&first, true).unwrap();
        assert_eq!(manager.free_block_count(), 1);

        // Three blocks needed, one free: the index gives its two back.
        let second = stream(vec![7, 8, 9, 10, 11], false);
        manager.init_stream_cache(&second, 0).unwrap();
        assert_eq!(second.block_count(), 3);
        assert_eq!(manager.cache_stats().reuse_blocks, 0);
    }

    #[test]
    fn test_release_tail_blocks() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3, 4, 5, 6], false);
        manager.init_stream_cache(&s, 0).unwrap();
        assert_eq!(manager.free_block_count(), 4);

        assert_eq!(manager.release_tail_blocks(&s, 2).unwrap(), 2);
        assert_eq!(s.block_count(), 1);
        assert_eq!(manager.free_block_count(), 6);

        // Draining past the end takes what is there.
        assert_eq!(manager.release_tail_blocks(&s, 5).unwrap(), 1);
        assert_eq!(manager.free_block_count(), 7);
    }

    #[test]
    fn test_stats_accounting_balances() {
        let mut manager = manager(8, 2);
        let s = stream(vec![1, 2, 3, 4, 5], true);
        manager.init_stream_cache(&s, 0).unwrap();
        manager.release_stream(&s, true).unwrap();

        let held = stream(vec![9, 9, 9], false);
        manager.init_stream_cache(&held, 0).unwrap();

        let stats = manager.cache_stats();
        assert_eq!(
            stats.free_blocks + stats.reuse_pinned_only + held.block_count(),
            stats.total_blocks - 1
        );
    }
}
