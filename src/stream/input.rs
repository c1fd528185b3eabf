//! Client-side request description

use serde::{Deserialize, Serialize};

/// Per-request generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Upper bound on generated tokens; the stream finishes when reached
    pub max_new_tokens: usize,
    /// Share prefix blocks with earlier identical prompts
    pub reuse_cache: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        GenerateConfig {
            max_new_tokens: usize::MAX,
            reuse_cache: false,
        }
    }
}

/// Everything a client supplies to start a generation stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateInput {
    pub request_id: u64,
    pub input_ids: Vec<u32>,
    pub generate_config: GenerateConfig,
}

impl GenerateInput {
    pub fn new(request_id: u64, input_ids: Vec<u32>) -> Self {
        GenerateInput {
            request_id,
            input_ids,
            generate_config: GenerateConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.generate_config = config;
        self
    }
}
