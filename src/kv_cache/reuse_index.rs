//! Prefix reuse index for KV-cache blocks
//!
//! Finished streams publish their full blocks here, keyed by the token
//! content they cover. A later stream whose prompt starts with the same
//! tokens picks those blocks up instead of recomputing the prefix.
//!
//! The index is a trie over consecutive `block_token_count`-sized token
//! chunks, stored flat: each entry is addressed by a hash chained from its
//! parent's hash and the chunk tokens. Entries keep the chunk itself and
//! verify it on lookup, so a hash collision degrades to a cache miss rather
//! than serving wrong blocks. Every resident entry holds one refcount on its
//! block; eviction is LRU over leaves whose block nobody else references.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::trace;

use super::block_pool::BlockPool;
use super::types::{BlockId, CacheResult};

/// Chain seed for the first chunk of a sequence
const ROOT_HASH: u64 = 0x9e3779b97f4a7c15;

#[derive(Debug)]
struct ReuseEntry {
    block: BlockId,
    chunk: Vec<u32>,
    parent: Option<u64>,
    child_count: usize,
    last_use: u64,
}

#[derive(Debug)]
pub struct ReuseIndex {
    entries: HashMap<u64, ReuseEntry>,
    block_token_count: usize,
    clock: u64,
}

fn chain_hash(parent: u64, chunk: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    chunk.hash(&mut hasher);
    hasher.finish()
}

impl ReuseIndex {
    pub fn new(block_token_count: usize) -> Self {
        ReuseIndex {
            entries: HashMap::new(),
            block_token_count,
            clock: 0,
        }
    }

    /// Longest resident prefix of `tokens` in whole chunks.
    ///
    /// Returns the matched blocks (already retained on behalf of the caller)
    /// and the matched token count, always a multiple of the chunk size.
    pub fn try_match(
        &mut self,
        tokens: &[u32],
        pool: &mut BlockPool,
    ) -> CacheResult<(Vec<BlockId>, usize)> {
        self.clock += 1;
        let mut blocks = Vec::new();
        let mut parent = ROOT_HASH;

        for chunk in tokens.chunks_exact(self.block_token_count) {
            let hash = chain_hash(parent, chunk);
            match self.entries.get_mut(&hash) {
                Some(entry) if entry.chunk == chunk => {
                    pool.retain(entry.block)?;
                    entry.last_use = self.clock;
                    blocks.push(entry.block);
                    parent = hash;
                }
                _ => break,
            }
        }

        let matched = blocks.len() * self.block_token_count;
        Ok((blocks, matched))
    }

    /// Publish the full blocks of a released stream.
    ///
    /// `blocks` must cover `tokens` chunk for chunk. A block whose chunk is
    /// new to the index keeps the stream's refcount (ownership transfers to
    /// the index); a block whose chunk is already resident is released, the
    /// index keeps its existing copy.
    pub fn publish(
        &mut self,
        tokens: &[u32],
        blocks: &[BlockId],
        pool: &mut BlockPool,
    ) -> CacheResult<()> {
        self.clock += 1;
        let mut parent = ROOT_HASH;

        let chunks = tokens.chunks_exact(self.block_token_count);
        for (index, chunk) in chunks.enumerate() {
            let Some(&block) = blocks.get(index) else {
                break;
            };
            let hash = chain_hash(parent, chunk);
            match self.entries.entry(hash) {
                Entry::Occupied(mut resident) if resident.get().chunk == chunk => {
                    resident.get_mut().last_use = self.clock;
                    pool.release(block)?;
                }
                Entry::Occupied(_) => {
                    // Collision with foreign content: nothing below this
                    // point can be linked, release the rest of the blocks.
                    for &rest in &blocks[index..] {
                        pool.release(rest)?;
                    }
                    return Ok(());
                }
                Entry::Vacant(slot) => {
                    slot.insert(ReuseEntry {
                        block,
                        chunk: chunk.to_vec(),
                        parent: (parent != ROOT_HASH).then_some(parent),
                        child_count: 0,
                        last_use: self.clock,
                    });
                    if parent != ROOT_HASH {
                        if let Some(entry) = self.entries.get_mut(&parent) {
                            entry.child_count += 1;
                        }
                    }
                    trace!(block, index, "published block to reuse index");
                }
            }
            parent = hash;
        }
        Ok(())
    }

    /// Unpin the least-recently-used leaf whose block nothing else holds.
    ///
    /// Returns the freed block id, or `None` when every entry is either an
    /// interior node or shared with an active stream.
    pub fn evict_lru(&mut self, pool: &mut BlockPool) -> CacheResult<Option<BlockId>> {
        let mut victim: Option<(u64, u64)> = None;
        for (&hash, entry) in &self.entries {
            if entry.child_count != 0 {
                continue;
            }
            if pool.ref_count(entry.block)? != 1 {
                continue;
            }
            if victim.map_or(true, |(_, last_use)| entry.last_use < last_use) {
                victim = Some((hash, entry.last_use));
            }
        }

        let Some((hash, _)) = victim else {
            return Ok(None);
        };
        let entry = self
            .entries
            .remove(&hash)
            .expect("victim picked from entries above");
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.child_count -= 1;
            }
        }
        pool.release(entry.block)?;
        trace!(block = entry.block, "evicted reuse entry");
        Ok(Some(entry.block))
    }

    /// Number of blocks pinned by the index
    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    /// Blocks held by the index and nothing else
    pub fn pinned_only_count(&self, pool: &BlockPool) -> usize {
        self.entries
            .values()
            .filter(|entry| pool.ref_count(entry.block).unwrap_or(0) == 1)
            .count()
    }
}
