//! Bridge configuration
//!
//! Load-time model configuration and per-request sampling parameters.
//! Hosts typically persist these with serde and hand them to the bridge
//! as-is; `validate` clamps anything out of range.

use serde::{Deserialize, Serialize};

/// Configuration applied when a model is loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Context window size in tokens
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Batch size for prompt ingestion
    pub batch_size: u32,
    /// Worker threads for decoding (0 = engine default)
    pub threads: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            gpu_layers: 99, // Offload all layers to GPU by default
            batch_size: 512,
            threads: 0,
        }
    }
}

impl ModelConfig {
    /// Validate configuration values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if self.context_size == 0 {
            self.context_size = 4096;
        }

        if self.batch_size == 0 {
            self.batch_size = 512;
        }

        if self.threads < 0 {
            self.threads = 0;
        }
    }
}

/// Sampling and length parameters for a single generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature parameter (0.0 - 2.0); below 0.01 selects greedy decoding
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Penalty applied to recently generated tokens (1.0 = disabled)
    pub repeat_penalty: f32,
    /// How many recent tokens the repeat penalty considers
    pub repeat_last_n: u32,
    /// Sampling seed (0 = random per request)
    pub seed: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: 0,
        }
    }
}

impl GenerationParams {
    /// Validate parameter values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = self.top_p.clamp(0.0, 1.0);

        // Ensure reasonable values for other parameters
        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }

        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.0;
        }
    }
}
