//! llamabridge
//!
//! An in-process bridge to a llama.cpp inference engine. Load a quantized
//! GGUF model once, then run text generation against it: blocking for
//! callers that want the full response, streaming for callers that want
//! tokens as they are produced.
//!
//! One request runs at a time; concurrent attempts fail fast with a `Busy`
//! error. An in-flight generation can be cancelled from any thread and
//! stops within one token.
//!
//! ```no_run
//! use llamabridge::{GenerationParams, LlamaBridge, ModelConfig, StreamEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = LlamaBridge::new();
//!     let info = bridge.load_model("models/gemma-2b.Q4_K_M.gguf", ModelConfig::default())?;
//!     println!("loaded {} ({} params)", info.name, info.param_count);
//!
//!     // Blocking: returns the whole response at once
//!     let text = bridge.generate("Why is the sky blue?", GenerationParams::default())?;
//!     println!("{text}");
//!
//!     // Streaming: tokens arrive as they are produced
//!     let mut stream = bridge.generate_stream("Tell me a story.", GenerationParams::default())?;
//!     while let Some(event) = stream.blocking_recv() {
//!         match event {
//!             StreamEvent::Token(fragment) => print!("{fragment}"),
//!             StreamEvent::Done(reason) => println!("\n[stopped: {reason}]"),
//!             StreamEvent::Error(e) => eprintln!("\ngeneration failed: {e}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod inference;

pub use bridge::{LlamaBridge, ModelStatus};
pub use config::{GenerationParams, ModelConfig};
pub use inference::{
    is_gguf_file, sink_fn, validate_gguf, CancelHandle, GenerationError, GgufError, GgufMetadata,
    LoadError, ModelInfo, StopReason, StreamEvent, TokenSink, TokenStream,
};
