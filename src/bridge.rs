//! Session controller
//!
//! [`LlamaBridge`] is the public face of the crate. It owns the engine
//! worker thread, tracks the model lifecycle, enforces the
//! one-request-at-a-time rule, and exposes blocking and streaming
//! generation.
//!
//! # Exclusivity
//!
//! Load, unload, and generate all compete for a single activity slot,
//! claimed with a compare-and-swap on a shared flag. A request that loses
//! the race fails fast with a `Busy` error instead of queueing; nothing
//! about the active request is disturbed. The winning request carries an
//! [`ActivityPermit`] to the worker, which releases it when the engine work
//! is finished, just before the reply or terminal event is delivered. A
//! caller that has observed the end of one request can therefore start the
//! next one immediately.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{GenerationParams, ModelConfig};
use crate::inference::engine::{self, GenerationError, WorkerCommand, WorkerHandle};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::model::{self, LoadError, ModelInfo};
use crate::inference::streaming::{
    spawn_dispatcher, CancelHandle, StopReason, TokenSink, TokenStream,
};

/// Observable model lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    /// No model is loaded
    Unloaded,
    /// A model is loaded and ready to generate
    Loaded(ModelInfo),
    /// The last load attempt failed; nothing is loaded
    Failed(String),
}

impl ModelStatus {
    /// Returns true if a model is ready to generate
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded(_))
    }
}

/// Exclusive right to run one mutating operation (load, unload, generate).
///
/// Acquired with a compare-and-swap on the shared busy flag and released
/// exactly once, on drop. The permit travels to the worker inside the
/// command so the slot stays taken for the whole native operation, then is
/// dropped there before the reply or terminal event goes out.
pub(crate) struct ActivityPermit {
    flag: Arc<AtomicBool>,
}

impl ActivityPermit {
    /// Claims the flag, or returns `None` if another request holds it.
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for ActivityPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// In-process bridge to a llama.cpp inference engine.
///
/// One bridge owns one engine worker and at most one loaded model. All
/// methods take `&self`; the bridge is `Send + Sync` and is meant to be
/// shared (for example in an `Arc`) between the thread that generates and
/// the thread that cancels.
///
/// At most one request runs at a time. Concurrent attempts fail fast with
/// [`LoadError::Busy`] or [`GenerationError::Busy`].
pub struct LlamaBridge {
    worker: WorkerHandle,
    busy: Arc<AtomicBool>,
    status: Mutex<ModelStatus>,
    active_cancel: Mutex<Option<CancelHandle>>,
}

impl LlamaBridge {
    /// Creates a bridge backed by the llama.cpp engine.
    ///
    /// Spawns the worker thread immediately; the native backend is
    /// initialized on that thread. No model is loaded yet.
    pub fn new() -> Self {
        Self::with_worker(engine::spawn_worker(LlamaCppBackend::init))
    }

    fn with_worker(worker: WorkerHandle) -> Self {
        Self {
            worker,
            busy: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(ModelStatus::Unloaded),
            active_cancel: Mutex::new(None),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, ModelStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancelHandle>> {
        self.active_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads a GGUF model, replacing any previously loaded one.
    ///
    /// The file header is validated before the engine touches anything, so
    /// a missing or malformed file is rejected without disturbing a model
    /// that is already loaded. A failure inside the native engine leaves
    /// the bridge unloaded with the failure recorded in [`ModelStatus`].
    ///
    /// Blocks until the load finishes. Fails with [`LoadError::Busy`] if
    /// any other request is active.
    pub fn load_model<P: AsRef<Path>>(
        &self,
        path: P,
        config: ModelConfig,
    ) -> Result<ModelInfo, LoadError> {
        let permit = ActivityPermit::acquire(&self.busy).ok_or(LoadError::Busy)?;
        let path = path.as_ref();

        let metadata = model::preflight(path)?;
        tracing::debug!(
            "GGUF v{} header accepted for {}",
            metadata.version,
            path.display()
        );

        let mut config = config;
        config.validate();

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.worker
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                config,
                reply: reply_tx,
                permit,
            })
            .map_err(|e| LoadError::EngineInitFailed(e.to_string()))?;

        let result = reply_rx.recv().map_err(|_| {
            LoadError::EngineInitFailed("inference worker is not running".to_string())
        })?;

        let mut status = self.lock_status();
        match &result {
            Ok(info) => {
                *status = ModelStatus::Loaded(info.clone());
                tracing::info!("Model ready: {}", info.name);
            }
            Err(e) => {
                // The engine releases any previous model before a load
                // attempt, so a native failure leaves nothing loaded.
                *status = ModelStatus::Failed(e.to_string());
                tracing::warn!("Model load failed: {}", e);
            }
        }
        drop(status);

        result
    }

    /// Unloads the current model and frees its memory.
    ///
    /// A no-op when nothing is loaded. Fails with [`LoadError::Busy`] while
    /// a generation is in flight; cancel it first.
    pub fn unload_model(&self) -> Result<(), LoadError> {
        let permit = ActivityPermit::acquire(&self.busy).ok_or(LoadError::Busy)?;

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.worker
            .send(WorkerCommand::UnloadModel {
                reply: reply_tx,
                permit,
            })
            .map_err(|e| LoadError::EngineInitFailed(e.to_string()))?;
        reply_rx.recv().map_err(|_| {
            LoadError::EngineInitFailed("inference worker is not running".to_string())
        })??;

        *self.lock_status() = ModelStatus::Unloaded;
        tracing::info!("Model unloaded");
        Ok(())
    }

    /// Returns the current model lifecycle state.
    pub fn status(&self) -> ModelStatus {
        self.lock_status().clone()
    }

    /// Returns information about the loaded model, if any.
    pub fn model_info(&self) -> Option<ModelInfo> {
        match &*self.lock_status() {
            ModelStatus::Loaded(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Returns true if a model is loaded and ready to generate.
    pub fn is_model_loaded(&self) -> bool {
        self.lock_status().is_loaded()
    }

    /// Returns true while any request (load, unload, generate) is active.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Generates a complete response, blocking until the model stops.
    ///
    /// Cancellation (via [`LlamaBridge::cancel`] from another thread)
    /// interrupts the wait and returns [`GenerationError::Cancelled`]; any
    /// partially generated text is discarded.
    ///
    /// Must not be called from an async context; use
    /// [`LlamaBridge::generate_stream`] with [`TokenStream::recv`] there.
    pub fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<String, GenerationError> {
        let stream = self.generate_stream(prompt, params)?;
        let (text, reason) = stream.wait()?;
        match reason {
            StopReason::Cancelled => Err(GenerationError::Cancelled),
            _ => Ok(text),
        }
    }

    /// Starts a generation and returns the stream of its tokens.
    ///
    /// Fragments arrive in production order; the stream always ends with
    /// exactly one terminal event carrying the stop reason or error.
    /// Dropping the stream cancels the generation.
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<TokenStream, GenerationError> {
        let permit = ActivityPermit::acquire(&self.busy).ok_or(GenerationError::Busy)?;

        if !self.lock_status().is_loaded() {
            return Err(GenerationError::ModelNotLoaded);
        }

        let mut params = params;
        params.validate();

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        *self.lock_cancel() = Some(cancel.clone());

        self.worker.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            params,
            events: events_tx,
            cancel: cancel.clone(),
            permit,
        })?;

        tracing::debug!("Generation request submitted");
        Ok(TokenStream::new(events_rx, cancel))
    }

    /// Starts a generation and dispatches its tokens into `sink`.
    ///
    /// Returns as soon as the request is submitted; delivery happens on a
    /// dedicated dispatcher thread. The sink receives fragments in order
    /// and `on_end` exactly once.
    pub fn generate_streaming<S: TokenSink>(
        &self,
        prompt: &str,
        params: GenerationParams,
        sink: S,
    ) -> Result<(), GenerationError> {
        let stream = self.generate_stream(prompt, params)?;
        spawn_dispatcher(stream, sink)
            .map_err(|e| GenerationError::Engine(format!("Failed to start dispatcher: {}", e)))?;
        Ok(())
    }

    /// Requests cancellation of the in-flight generation, if any.
    ///
    /// Returns immediately; the decode loop stops within one token. Safe to
    /// call from any thread, at any time, repeatedly.
    pub fn cancel(&self) {
        if let Some(handle) = self.lock_cancel().as_ref() {
            handle.cancel();
            tracing::debug!("Cancellation requested");
        }
    }
}

impl Default for LlamaBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaBridge {
    fn drop(&mut self) {
        // Stop any in-flight request so worker shutdown is not held behind it
        self.cancel();
    }
}
