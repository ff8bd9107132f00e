//! Inference engine worker
//!
//! Core logic for running generation requests against a native engine.
//!
//! # Architecture
//!
//! The native llama.cpp types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! contain raw pointers that are not `Send`, so every engine operation runs
//! on one dedicated worker thread that owns the backend for its whole life.
//! Callers talk to it through a command channel; generated tokens flow back
//! through a per-request event channel.
//!
//! The engine itself sits behind [`ModelBackend`] and [`DecodeSession`] so
//! the decode loop, stop-priority rules, and delivery guarantees can be
//! exercised without loading real model weights.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::bridge::ActivityPermit;
use crate::config::{GenerationParams, ModelConfig};
use crate::inference::model::{LoadError, ModelInfo};
use crate::inference::streaming::{CancelHandle, StopReason, StreamEvent, Utf8Buffer};

/// Errors that can occur during generation requests
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("No model loaded")]
    ModelNotLoaded,

    #[error("Another request is active")]
    Busy,

    #[error("Prompt too long: {tokens} tokens exceeds the {window}-token context window")]
    PromptTooLong { tokens: usize, window: usize },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Inference engine error: {0}")]
    Engine(String),
}

/// The decode state of one generation request.
///
/// A session wraps whatever per-request state the engine needs (context,
/// sampler chain, position counters) behind the handful of operations the
/// decode loop performs. Implementations live on the worker thread and do
/// not need to be `Send`.
pub trait DecodeSession {
    /// Opaque token representation of the underlying engine.
    type Token: Copy;

    /// Converts prompt text into engine tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<Self::Token>, GenerationError>;

    /// Usable context window for this session, in tokens.
    fn context_window(&self) -> usize;

    /// Ingests the prompt and prepares logits for the first sampling step.
    fn feed_prompt(&mut self, tokens: &[Self::Token]) -> Result<(), GenerationError>;

    /// Samples the next token from the current state.
    fn next_token(&mut self) -> Result<Self::Token, GenerationError>;

    /// Returns true if the token ends the sequence.
    fn is_end_of_sequence(&self, token: Self::Token) -> bool;

    /// Raw UTF-8 bytes for one token; may end mid-codepoint.
    fn detokenize(&self, token: Self::Token) -> Result<Vec<u8>, GenerationError>;

    /// Commits a sampled token so the next step can see it.
    fn advance(&mut self, token: Self::Token) -> Result<(), GenerationError>;
}

/// Capability surface of a native inference engine.
///
/// Owned by the worker thread; never crosses thread boundaries after
/// construction.
pub trait ModelBackend {
    type Session<'a>: DecodeSession
    where
        Self: 'a;

    /// Loads a model, replacing any previously loaded one.
    fn load_model(&mut self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, LoadError>;

    /// Releases the current model and its memory.
    fn unload_model(&mut self);

    /// Starts a decode session for one request.
    fn begin_session(
        &mut self,
        params: &GenerationParams,
    ) -> Result<Self::Session<'_>, GenerationError>;
}

/// Commands sent to the worker thread.
///
/// Mutating commands carry the [`ActivityPermit`] acquired at submission;
/// the worker drops it when the engine work is done, before the reply or
/// terminal event goes out.
pub(crate) enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        config: ModelConfig,
        reply: Sender<Result<ModelInfo, LoadError>>,
        permit: ActivityPermit,
    },
    UnloadModel {
        reply: Sender<Result<(), LoadError>>,
        permit: ActivityPermit,
    },
    Generate {
        prompt: String,
        params: GenerationParams,
        events: UnboundedSender<StreamEvent>,
        cancel: CancelHandle,
        permit: ActivityPermit,
    },
    Shutdown,
}

/// Handle to the engine worker thread.
///
/// Dropping the handle shuts the worker down and joins it.
pub(crate) struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Sends a command to the worker. Fails only if the worker thread died.
    pub(crate) fn send(&self, command: WorkerCommand) -> Result<(), GenerationError> {
        self.tx
            .send(command)
            .map_err(|_| GenerationError::Engine("inference worker is not running".to_string()))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawns the engine worker thread.
///
/// The backend is constructed by `make_backend` on the worker thread itself,
/// since native engine types cannot be created elsewhere and moved in. If
/// construction fails the worker stays alive and answers every request with
/// the initialization error instead of leaving callers hanging.
pub(crate) fn spawn_worker<B, F>(make_backend: F) -> WorkerHandle
where
    B: ModelBackend,
    F: FnOnce() -> Result<B, String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || match make_backend() {
        Ok(backend) => {
            tracing::debug!("Inference worker started");
            worker_main(backend, rx);
        }
        Err(reason) => {
            tracing::error!("Inference backend failed to initialize: {}", reason);
            refuse_all(reason, rx);
        }
    });
    WorkerHandle {
        tx,
        thread: Some(thread),
    }
}

/// Worker thread main loop. Owns the backend, processes commands in order.
fn worker_main<B: ModelBackend>(mut backend: B, rx: Receiver<WorkerCommand>) {
    loop {
        match rx.recv() {
            Ok(WorkerCommand::LoadModel {
                path,
                config,
                reply,
                permit,
            }) => {
                let result = catch_unwind(AssertUnwindSafe(|| backend.load_model(&path, &config)))
                    .unwrap_or_else(|payload| {
                        Err(LoadError::EngineInitFailed(panic_message(payload)))
                    });
                drop(permit);
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::UnloadModel { reply, permit }) => {
                backend.unload_model();
                drop(permit);
                let _ = reply.send(Ok(()));
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                events,
                cancel,
                permit,
            }) => {
                let outcome = run_request(&mut backend, &prompt, &params, &events, &cancel);
                // Release the activity slot before the terminal event goes
                // out, so a consumer that has seen the end of one request
                // can immediately start the next.
                drop(permit);
                let terminal = match outcome {
                    Ok(reason) => StreamEvent::Done(reason),
                    Err(e) => StreamEvent::Error(e),
                };
                let _ = events.send(terminal);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("Inference worker shutting down");
                break;
            }
            Err(_) => {
                // Command channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Fallback loop for a worker whose backend never came up.
fn refuse_all(reason: String, rx: Receiver<WorkerCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            WorkerCommand::LoadModel { reply, permit, .. } => {
                drop(permit);
                let _ = reply.send(Err(LoadError::EngineInitFailed(reason.clone())));
            }
            WorkerCommand::UnloadModel { reply, permit } => {
                drop(permit);
                let _ = reply.send(Err(LoadError::EngineInitFailed(reason.clone())));
            }
            WorkerCommand::Generate { events, permit, .. } => {
                drop(permit);
                let _ = events.send(StreamEvent::Error(GenerationError::Engine(reason.clone())));
            }
            WorkerCommand::Shutdown => break,
        }
    }
}

/// Runs one generation request with a panic boundary.
///
/// A panic inside the native engine must not take the worker thread down
/// mid-request; it becomes a normal [`GenerationError::Engine`] terminal.
fn run_request<B: ModelBackend>(
    backend: &mut B,
    prompt: &str,
    params: &GenerationParams,
    events: &UnboundedSender<StreamEvent>,
    cancel: &CancelHandle,
) -> Result<StopReason, GenerationError> {
    match catch_unwind(AssertUnwindSafe(|| {
        let mut session = backend.begin_session(params)?;
        run_generation(&mut session, prompt, params, events, cancel)
    })) {
        Ok(outcome) => outcome,
        Err(payload) => Err(GenerationError::Engine(panic_message(payload))),
    }
}

/// Runs the decode loop for one request.
///
/// Stop conditions are checked in priority order on every step:
/// cancellation first, then the token limit, then end-of-sequence on the
/// freshly sampled token. Fragments go out as soon as they decode to
/// complete UTF-8; the terminal event is sent by the caller.
fn run_generation<S: DecodeSession>(
    session: &mut S,
    prompt: &str,
    params: &GenerationParams,
    events: &UnboundedSender<StreamEvent>,
    cancel: &CancelHandle,
) -> Result<StopReason, GenerationError> {
    let tokens = session.tokenize(prompt)?;
    if tokens.is_empty() {
        return Err(GenerationError::Tokenization(
            "prompt produced no tokens".to_string(),
        ));
    }

    let window = session.context_window();
    if tokens.len() >= window {
        return Err(GenerationError::PromptTooLong {
            tokens: tokens.len(),
            window,
        });
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    if cancel.is_cancelled() {
        tracing::debug!("Generation cancelled before prompt ingestion");
        return Ok(StopReason::Cancelled);
    }

    session.feed_prompt(&tokens)?;

    let started = Instant::now();
    let mut utf8 = Utf8Buffer::default();
    let mut produced: u32 = 0;

    let reason = loop {
        if cancel.is_cancelled() {
            tracing::debug!("Generation cancelled after {} tokens", produced);
            break StopReason::Cancelled;
        }
        if produced >= params.max_tokens {
            break StopReason::MaxTokens;
        }

        let token = session.next_token()?;

        if session.is_end_of_sequence(token) {
            tracing::debug!("End of sequence after {} tokens", produced);
            break StopReason::EndOfSequence;
        }

        let bytes = session.detokenize(token)?;
        produced += 1;

        if let Some(fragment) = utf8.push(&bytes) {
            if events.send(StreamEvent::Token(fragment)).is_err() {
                // Receiver dropped; nobody is listening anymore
                tracing::debug!("Consumer went away, stopping generation");
                break StopReason::Cancelled;
            }
        }

        session.advance(token)?;
    };

    // Whatever is still buffered and decodable goes out before the terminal
    if let Some(rest) = utf8.flush() {
        let _ = events.send(StreamEvent::Token(rest));
    }

    let elapsed = started.elapsed().as_secs_f32();
    tracing::debug!(
        "Generated {} tokens in {:.2}s ({:.1} tok/s), stopped: {}",
        produced,
        elapsed,
        produced as f32 / elapsed.max(f32::EPSILON),
        reason,
    );

    Ok(reason)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Inference engine panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Inference engine panicked: {}", s)
    } else {
        "Inference engine panicked".to_string()
    }
}

/// Scripted backend for exercising the worker and decode loop without
/// model weights.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// Lets a test hold a decode step until it explicitly opens the gate.
    /// Dropping the sender opens the gate permanently.
    pub(crate) type Gate = Arc<Mutex<mpsc::Receiver<()>>>;

    pub(crate) fn gate() -> (mpsc::Sender<()>, Gate) {
        let (tx, rx) = mpsc::channel();
        (tx, Arc::new(Mutex::new(rx)))
    }

    /// One scripted decode step.
    #[derive(Clone)]
    pub(crate) enum Step {
        /// Produce a token that detokenizes to this text.
        Text(&'static str),
        /// Produce a token with these raw bytes.
        Bytes(&'static [u8]),
        /// Block until the gate opens, then produce this text.
        Gated(Gate, &'static str),
        /// Produce the end-of-sequence token.
        Eos,
        /// Fail the decode step.
        Fail(&'static str),
        /// Panic inside the decode step.
        Panic,
    }

    const EOS_TOKEN: usize = usize::MAX;

    /// Scripted [`ModelBackend`]; every session replays the same script.
    pub(crate) struct ScriptedBackend {
        pub script: Vec<Step>,
        pub window: usize,
        pub fail_next_load: bool,
        loaded: Option<ModelInfo>,
    }

    impl ScriptedBackend {
        pub fn new(script: Vec<Step>) -> Self {
            Self {
                script,
                window: 4096,
                fail_next_load: false,
                loaded: None,
            }
        }

        pub fn with_window(mut self, window: usize) -> Self {
            self.window = window;
            self
        }

        pub fn failing_next_load(mut self) -> Self {
            self.fail_next_load = true;
            self
        }
    }

    pub(crate) struct ScriptedSession {
        script: Vec<Step>,
        window: usize,
        cursor: usize,
    }

    impl ModelBackend for ScriptedBackend {
        type Session<'a> = ScriptedSession
        where
            Self: 'a;

        fn load_model(
            &mut self,
            path: &Path,
            _config: &ModelConfig,
        ) -> Result<ModelInfo, LoadError> {
            if self.fail_next_load {
                self.fail_next_load = false;
                return Err(LoadError::EngineInitFailed(
                    "scripted load failure".to_string(),
                ));
            }
            let info = ModelInfo {
                name: ModelInfo::display_name(path),
                path: path.to_path_buf(),
                vocab_size: 32_000,
                embedding_dim: 2048,
                context_length: self.window as u32,
                param_count: 1_000_000,
                size_bytes: 4096,
            };
            self.loaded = Some(info.clone());
            Ok(info)
        }

        fn unload_model(&mut self) {
            self.loaded = None;
        }

        fn begin_session(
            &mut self,
            _params: &GenerationParams,
        ) -> Result<ScriptedSession, GenerationError> {
            if self.loaded.is_none() {
                return Err(GenerationError::ModelNotLoaded);
            }
            Ok(ScriptedSession {
                script: self.script.clone(),
                window: self.window,
                cursor: 0,
            })
        }
    }

    impl DecodeSession for ScriptedSession {
        type Token = usize;

        fn tokenize(&self, text: &str) -> Result<Vec<usize>, GenerationError> {
            // One pseudo-token per byte plus a leading BOS-like token
            Ok(std::iter::once(0)
                .chain(text.bytes().map(|b| b as usize + 1))
                .collect())
        }

        fn context_window(&self) -> usize {
            self.window
        }

        fn feed_prompt(&mut self, _tokens: &[usize]) -> Result<(), GenerationError> {
            Ok(())
        }

        fn next_token(&mut self) -> Result<usize, GenerationError> {
            let step = self.script.get(self.cursor).cloned().unwrap_or(Step::Eos);
            let id = self.cursor;
            self.cursor += 1;
            match step {
                Step::Text(_) | Step::Bytes(_) => Ok(id),
                Step::Gated(gate, _) => {
                    let rx = gate.lock().unwrap_or_else(|p| p.into_inner());
                    let _ = rx.recv_timeout(Duration::from_secs(5));
                    Ok(id)
                }
                Step::Eos => Ok(EOS_TOKEN),
                Step::Fail(message) => Err(GenerationError::Engine(message.to_string())),
                Step::Panic => panic!("scripted decode panic"),
            }
        }

        fn is_end_of_sequence(&self, token: usize) -> bool {
            token == EOS_TOKEN
        }

        fn detokenize(&self, token: usize) -> Result<Vec<u8>, GenerationError> {
            match self.script.get(token) {
                Some(Step::Text(text)) | Some(Step::Gated(_, text)) => Ok(text.as_bytes().to_vec()),
                Some(Step::Bytes(bytes)) => Ok(bytes.to_vec()),
                _ => Ok(Vec::new()),
            }
        }

        fn advance(&mut self, _token: usize) -> Result<(), GenerationError> {
            Ok(())
        }
    }
}
