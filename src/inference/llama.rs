//! llama.cpp backend
//!
//! Production [`ModelBackend`] over `llama-cpp-2`. Everything in this module
//! runs on the engine worker thread; the wrapped types hold raw pointers and
//! must never leave it.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use crate::config::{GenerationParams, ModelConfig};
use crate::inference::engine::{DecodeSession, GenerationError, ModelBackend};
use crate::inference::model::{LoadError, ModelInfo};

/// Native llama.cpp engine state: the backend handle and the loaded model.
pub(crate) struct LlamaCppBackend {
    backend: LlamaBackend,
    loaded: Option<LoadedModel>,
}

struct LoadedModel {
    model: LlamaModel,
    config: ModelConfig,
}

impl LlamaCppBackend {
    /// Initializes the llama.cpp backend.
    ///
    /// Routes native log output into `tracing`. Must run on the thread that
    /// will own all subsequent model and context operations.
    pub(crate) fn init() -> Result<Self, String> {
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(true));
        let backend = LlamaBackend::init()
            .map_err(|e| format!("Failed to initialize llama backend: {}", e))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(Self {
            backend,
            loaded: None,
        })
    }
}

impl ModelBackend for LlamaCppBackend {
    type Session<'a> = LlamaSession<'a>
    where
        Self: 'a;

    fn load_model(&mut self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, LoadError> {
        // Release the previous model before mapping the new one; holding
        // both would double peak memory on multi-gigabyte artifacts.
        if self.loaded.take().is_some() {
            tracing::debug!("Previous model released before load");
        }

        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| map_load_failure(e.to_string()))?;

        let info = ModelInfo {
            name: ModelInfo::display_name(path),
            path: path.to_path_buf(),
            vocab_size: model.n_vocab(),
            embedding_dim: model.n_embd(),
            context_length: model.n_ctx_train(),
            param_count: model.n_params() as u64,
            size_bytes: model.size() as u64,
        };
        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} train ctx)",
            info.name,
            info.param_count,
            info.vocab_size,
            info.context_length
        );

        self.loaded = Some(LoadedModel {
            model,
            config: config.clone(),
        });
        Ok(info)
    }

    fn unload_model(&mut self) {
        if self.loaded.take().is_some() {
            tracing::info!("Model unloaded, memory released");
        }
    }

    fn begin_session(
        &mut self,
        params: &GenerationParams,
    ) -> Result<LlamaSession<'_>, GenerationError> {
        let loaded = self.loaded.as_ref().ok_or(GenerationError::ModelNotLoaded)?;

        let n_ctx = effective_context(loaded.config.context_size, loaded.model.n_ctx_train());
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(loaded.config.batch_size);
        if loaded.config.threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(loaded.config.threads)
                .with_n_threads_batch(loaded.config.threads);
        }

        let ctx = loaded
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| GenerationError::Engine(format!("Failed to create context: {}", e)))?;

        Ok(LlamaSession {
            model: &loaded.model,
            ctx,
            batch: LlamaBatch::new(loaded.config.batch_size as usize, 1),
            sampler: build_sampler(params),
            batch_size: loaded.config.batch_size as usize,
            n_ctx: n_ctx as usize,
            n_past: 0,
        })
    }
}

/// Context window actually used for a session: the configured size capped at
/// the model's training length, with a floor so tiny configs stay usable.
fn effective_context(configured: u32, trained: u32) -> u32 {
    configured.min(trained).max(2048)
}

/// Classifies a native load failure. llama.cpp reports allocation failures
/// as strings, so this is a best-effort match on the message.
fn map_load_failure(message: String) -> LoadError {
    let lower = message.to_lowercase();
    if lower.contains("out of memory")
        || lower.contains("insufficient memory")
        || lower.contains("failed to allocate")
        || lower.contains("cannot allocate")
    {
        LoadError::OutOfMemory(message)
    } else {
        LoadError::EngineInitFailed(message)
    }
}

/// Builds the sampler chain for one request.
///
/// Very low temperatures select plain greedy decoding. Otherwise the chain
/// is repetition penalty (when enabled), top-k, top-p, temperature, and the
/// final seeded distribution sampler.
fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    if params.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    let mut chain = Vec::with_capacity(5);
    if (params.repeat_penalty - 1.0).abs() > f32::EPSILON {
        chain.push(LlamaSampler::penalties(
            params.repeat_last_n as i32,
            params.repeat_penalty,
            0.0,
            0.0,
        ));
    }
    chain.push(LlamaSampler::top_k(params.top_k as i32));
    chain.push(LlamaSampler::top_p(params.top_p, 1));
    chain.push(LlamaSampler::temp(params.temperature));
    chain.push(LlamaSampler::dist(seed));
    LlamaSampler::chain_simple(chain)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// One generation's native decode state: context, batch, and sampler chain.
pub(crate) struct LlamaSession<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    batch: LlamaBatch<'a>,
    sampler: LlamaSampler,
    batch_size: usize,
    n_ctx: usize,
    n_past: i32,
}

impl DecodeSession for LlamaSession<'_> {
    type Token = LlamaToken;

    fn tokenize(&self, text: &str) -> Result<Vec<LlamaToken>, GenerationError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| GenerationError::Tokenization(e.to_string()))
    }

    fn context_window(&self) -> usize {
        self.n_ctx
    }

    fn feed_prompt(&mut self, tokens: &[LlamaToken]) -> Result<(), GenerationError> {
        // Fed in batch-sized chunks so long prompts fit; logits are only
        // requested for the very last prompt token.
        let last = tokens.len() - 1;
        let mut base = 0usize;
        for chunk in tokens.chunks(self.batch_size) {
            self.batch.clear();
            for (i, token) in chunk.iter().enumerate() {
                let pos = base + i;
                self.batch
                    .add(*token, pos as i32, &[0], pos == last)
                    .map_err(|e| {
                        GenerationError::Engine(format!("Failed to batch prompt token: {}", e))
                    })?;
            }
            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| GenerationError::Engine(format!("Failed to decode prompt: {}", e)))?;
            base += chunk.len();
        }
        self.n_past = tokens.len() as i32;
        Ok(())
    }

    fn next_token(&mut self) -> Result<LlamaToken, GenerationError> {
        let token = self.sampler.sample(&self.ctx, self.batch.n_tokens() - 1);
        self.sampler.accept(token);
        Ok(token)
    }

    fn is_end_of_sequence(&self, token: LlamaToken) -> bool {
        self.model.is_eog_token(token)
    }

    fn detokenize(&self, token: LlamaToken) -> Result<Vec<u8>, GenerationError> {
        self.model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| GenerationError::Engine(format!("Failed to decode token bytes: {}", e)))
    }

    fn advance(&mut self, token: LlamaToken) -> Result<(), GenerationError> {
        if self.n_past as usize >= self.n_ctx {
            return Err(GenerationError::Engine(
                "context window exhausted".to_string(),
            ));
        }
        self.batch.clear();
        self.batch
            .add(token, self.n_past, &[0], true)
            .map_err(|e| GenerationError::Engine(format!("Failed to batch token: {}", e)))?;
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| GenerationError::Engine(format!("Failed to decode token: {}", e)))?;
        self.n_past += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_context_caps_at_training_length() {
        assert_eq!(effective_context(8192, 4096), 4096);
        assert_eq!(effective_context(4096, 8192), 4096);
    }

    #[test]
    fn test_effective_context_has_a_floor() {
        assert_eq!(effective_context(512, 8192), 2048);
        assert_eq!(effective_context(4096, 1024), 2048);
    }

    #[test]
    fn test_map_load_failure_detects_oom() {
        assert!(matches!(
            map_load_failure("ggml backend: failed to allocate buffer".to_string()),
            LoadError::OutOfMemory(_)
        ));
        assert!(matches!(
            map_load_failure("CUDA error: out of memory".to_string()),
            LoadError::OutOfMemory(_)
        ));
        assert!(matches!(
            map_load_failure("unknown architecture 'gpt-7'".to_string()),
            LoadError::EngineInitFailed(_)
        ));
    }
}
