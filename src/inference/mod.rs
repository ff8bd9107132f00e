//! LLM inference engine
//!
//! Everything that talks to llama.cpp: model validation and loading, the
//! worker thread that owns the native state, the decode loop, and streaming
//! token delivery.

pub mod engine;
pub(crate) mod llama;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{DecodeSession, GenerationError, ModelBackend};
pub use model::{
    is_gguf_file, validate_gguf, GgufError, GgufMetadata, LoadError, ModelInfo, GGUF_MAGIC,
};
pub use streaming::{sink_fn, CancelHandle, StopReason, StreamEvent, TokenSink, TokenStream};
