//! KV-cache configuration and sizing
//!
//! `CacheConfig` is the validated shape of the block pool. It is either
//! constructed directly (tests, embedders that know their block budget) or
//! derived by `CacheConfigCreator` from the model shape and the free device
//! memory reported by the runtime.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{CacheError, CacheResult, DType};

/// Validated block-pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub block_count: usize,
    pub block_token_count: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub dtype: DType,
}

impl CacheConfig {
    pub fn new(
        block_count: usize,
        block_token_count: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_size: usize,
        dtype: DType,
    ) -> CacheResult<Self> {
        if block_token_count == 0 || num_layers == 0 || num_kv_heads == 0 || head_size == 0 {
            return Err(CacheError::InvalidConfiguration(
                "cache shape parameters must be non-zero".to_string(),
            ));
        }
        // One block is the sentinel; at least one must remain usable.
        if block_count < 2 {
            return Err(CacheError::InvalidConfiguration(format!(
                "block count {} below minimum of 2",
                block_count
            )));
        }

        Ok(CacheConfig {
            block_count,
            block_token_count,
            num_layers,
            num_kv_heads,
            head_size,
            dtype,
        })
    }

    /// Device bytes one block occupies; the factor 2 covers K and V
    pub fn block_size_bytes(&self) -> usize {
        2 * self.num_layers
            * self.num_kv_heads
            * self.head_size
            * self.block_token_count
            * self.dtype.size_bytes()
    }

    /// Token positions the whole pool can back, excluding the sentinel
    pub fn max_cached_tokens(&self) -> usize {
        (self.block_count - 1) * self.block_token_count
    }
}

/// Inputs for deriving a cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheParams {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub dtype: DType,
    pub block_token_count: usize,
    pub max_seq_len: usize,
    pub device_free_bytes: u64,
    /// Fraction of free device memory given to the KV cache
    pub memory_fraction: f64,
}

impl CacheParams {
    pub fn new(num_layers: usize, num_kv_heads: usize, head_size: usize, dtype: DType) -> Self {
        CacheParams {
            num_layers,
            num_kv_heads,
            head_size,
            dtype,
            block_token_count: 16,
            max_seq_len: 8192,
            device_free_bytes: 0,
            memory_fraction: 0.9,
        }
    }

    pub fn with_block_token_count(mut self, block_token_count: usize) -> Self {
        self.block_token_count = block_token_count;
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    pub fn with_device_free_bytes(mut self, bytes: u64) -> Self {
        self.device_free_bytes = bytes;
        self
    }

    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

/// Derives the block count from device memory and model shape
pub struct CacheConfigCreator;

impl CacheConfigCreator {
    pub fn create(params: &CacheParams) -> CacheResult<CacheConfig> {
        let budget = Self::kv_cache_budget_bytes(params);
        let probe = CacheConfig::new(
            2,
            params.block_token_count,
            params.num_layers,
            params.num_kv_heads,
            params.head_size,
            params.dtype,
        )?;
        let block_bytes = probe.block_size_bytes() as u64;
        let block_count = (budget / block_bytes) as usize;

        let config = CacheConfig::new(
            block_count,
            params.block_token_count,
            params.num_layers,
            params.num_kv_heads,
            params.head_size,
            params.dtype,
        )?;
        info!(
            block_count = config.block_count,
            block_bytes,
            budget, "derived KV cache configuration"
        );
        if config.max_cached_tokens() < params.max_seq_len {
            warn!(
                max_seq_len = params.max_seq_len,
                capacity = config.max_cached_tokens(),
                "KV cache cannot back a single full-length sequence"
            );
        }
        Ok(config)
    }

    fn kv_cache_budget_bytes(params: &CacheParams) -> u64 {
        (params.device_free_bytes as f64 * params.memory_fraction) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_validation() {
        let config = CacheConfig::new(4, 8, 1, 1, 4, DType::F16);
        assert!(config.is_ok());

        let invalid = [
            CacheConfig::new(1, 8, 1, 1, 4, DType::F16),
            CacheConfig::new(4, 0, 1, 1, 4, DType::F16),
            CacheConfig::new(4, 8, 0, 1, 4, DType::F16),
            CacheConfig::new(4, 8, 1, 0, 4, DType::F16),
            CacheConfig::new(4, 8, 1, 1, 0, DType::F16),
        ];
        for config in invalid {
            assert!(matches!(config, Err(CacheError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_block_size_bytes() {
        let config = CacheConfig::new(4, 8, 2, 4, 64, DType::F16).unwrap();
        // 2 (K+V) * 2 layers * 4 heads * 64 dim * 8 tokens * 2 bytes
        assert_eq!(config.block_size_bytes(), 2 * 2 * 4 * 64 * 8 * 2);
    }

    #[test]
    fn test_max_cached_tokens_excludes_sentinel() {
        let config = CacheConfig::new(4, 8, 1, 1, 4, DType::F16).unwrap();
        assert_eq!(config.max_cached_tokens(), 24);
    }

    #[test]
    fn test_creator_derives_block_count() {
        // Block bytes: 2 * 1 * 1 * 4 * 2 * 2 = 32
        let params = CacheParams::new(1, 1, 4, DType::F16)
            .with_block_token_count(2)
            .with_device_free_bytes(320)
            .with_memory_fraction(1.0);
        let config = CacheConfigCreator::create(&params).unwrap();
        assert_eq!(config.block_count, 10);
        assert_eq!(config.block_token_count, 2);
    }

    #[test]
    fn test_creator_honors_memory_fraction() {
        let params = CacheParams::new(1, 1, 4, DType::F16)
            .with_block_token_count(2)
            .with_device_free_bytes(320)
            .with_memory_fraction(0.5);
        let config = CacheConfigCreator::create(&params).unwrap();
        assert_eq!(config.block_count, 5);
    }

    #[test]
    fn test_creator_rejects_tiny_budget() {
        let params = CacheParams::new(1, 1, 4, DType::F16)
            .with_block_token_count(2)
            .with_device_free_bytes(40)
            .with_memory_fraction(1.0);
        assert!(matches!(
            CacheConfigCreator::create(&params),
            Err(CacheError::InvalidConfiguration(_))
        ));
    }
}
