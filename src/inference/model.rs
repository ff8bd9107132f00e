//! Model artifacts
//!
//! GGUF header validation, the load-failure taxonomy, and the metadata
//! describing a loaded model. Header checks run before any native engine
//! work so an obviously broken file is rejected cheaply.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors produced while inspecting a GGUF file header
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Errors returned by model load and unload operations
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Model file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(#[from] GgufError),

    #[error("Insufficient memory to load model: {0}")]
    OutOfMemory(String),

    #[error("Engine initialization failed: {0}")]
    EngineInitFailed(String),

    #[error("Another request is active")]
    Busy,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Information about the currently loaded model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Display name derived from the file name
    pub name: String,
    /// Path the model was loaded from
    pub path: PathBuf,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Context length the model was trained with
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

impl ModelInfo {
    /// Derives a display name from a model path ("model.Q4_K_M.gguf" -> "model.Q4_K_M")
    pub(crate) fn display_name(path: &Path) -> String {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }
}

fn read_le<const N: usize>(file: &mut File) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    file.read_exact(&mut buf).map_err(|e| match e.kind() {
        // A header cut short is a malformed file, not an I/O problem
        std::io::ErrorKind::UnexpectedEof => GgufError::FileTooSmall,
        _ => GgufError::Io(e),
    })?;
    Ok(buf)
}

/// Validates that a file carries a GGUF header and extracts basic metadata.
///
/// Only the fixed 24-byte prefix is read: magic, version, tensor count, and
/// metadata key-value count. Tensor data is never touched.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, GgufError> {
    let mut file = File::open(path)?;

    let magic = u32::from_le_bytes(read_le(&mut file)?);
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes(read_le(&mut file)?);
    // GGUF v2 and v3 are supported
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = u64::from_le_bytes(read_le(&mut file)?);
    let metadata_kv_count = u64::from_le_bytes(read_le(&mut file)?);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Preflight check run before a model path is handed to the native engine.
///
/// Distinguishes a missing file from a malformed one so callers get the
/// right [`LoadError`] variant without paying for a full load attempt.
pub(crate) fn preflight<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, LoadError> {
    let path = path.as_ref();
    match validate_gguf(path) {
        Ok(metadata) => Ok(metadata),
        Err(GgufError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(LoadError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => Err(LoadError::UnsupportedFormat(e)),
    }
}

/// Checks if a file appears to be a GGUF model file based on extension and magic bytes.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();

    // Check extension first (quick check)
    match path.extension() {
        Some(ext) if ext.to_string_lossy().eq_ignore_ascii_case("gguf") => {}
        _ => return false,
    }

    validate_gguf(path).is_ok()
}
