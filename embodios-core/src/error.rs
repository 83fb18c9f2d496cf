//! Error taxonomy.
//!
//! No `std::error::Error` impl — this crate is `no_std` in its production
//! configuration. Callers that do have `std` (the repl harness) wrap these
//! in `anyhow`.

use core::fmt;

/// Top-level error taxonomy, grouped into load/resource/state/runtime/io families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    // ── Load ──────────────────────────────────────────────────────────
    BadMagic,
    UnsupportedVersion(u32),
    Truncated,
    MalformedTensor,
    UnsupportedQuant,
    MissingMetadata(&'static str),

    // ── Resource ──────────────────────────────────────────────────────
    OutOfMemory,
    BufferTooSmall,

    // ── State ─────────────────────────────────────────────────────────
    WrongState,
    NotInitialized,

    // ── Runtime ───────────────────────────────────────────────────────
    NumericOverflow,
    InvalidTokenId,
    ContextOverflow,

    // ── IO ────────────────────────────────────────────────────────────
    ReadFailed,
    Timeout,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BadMagic => write!(f, "GGUF magic mismatch"),
            EngineError::UnsupportedVersion(v) => write!(f, "unsupported GGUF version {v}"),
            EngineError::Truncated => write!(f, "GGUF stream truncated"),
            EngineError::MalformedTensor => write!(f, "malformed tensor record"),
            EngineError::UnsupportedQuant => write!(f, "unsupported quantization kind"),
            EngineError::MissingMetadata(key) => write!(f, "missing metadata key: {key}"),
            EngineError::OutOfMemory => write!(f, "out of memory"),
            EngineError::BufferTooSmall => write!(f, "caller-provided buffer too small"),
            EngineError::WrongState => write!(f, "engine call invalid in current state"),
            EngineError::NotInitialized => write!(f, "engine not initialized"),
            EngineError::NumericOverflow => write!(f, "numeric overflow"),
            EngineError::InvalidTokenId => write!(f, "invalid token id"),
            EngineError::ContextOverflow => write!(f, "position reached max_seq_len"),
            EngineError::ReadFailed => write!(f, "block device read failed"),
            EngineError::Timeout => write!(f, "block device read timed out"),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Result of a `generate` call that aborted partway through. Runtime errors
/// inside `generate` abort the current generation, leave the engine in
/// `Ready`, and return the number of tokens already produced alongside the
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialGeneration {
    pub tokens_produced: usize,
    pub error: EngineError,
}
