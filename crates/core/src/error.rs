//! Engine error taxonomy.
//!
//! Every public operation returns [`Result`]. Input errors are reported
//! without touching engine state; resource errors ([`EngineError::MemoryOverflow`])
//! are returned only after the engine has restored its pre-call sizes.

use std::io;

/// Errors surfaced by public index operations.
///
/// Nothing is retried internally; every failure propagates to the caller.
/// The one exception is the background tree rebuild, whose failures are
/// logged and dropped, leaving the previous trees intact.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The index has no searchable data (not built, or refined down to zero rows).
    #[error("index is empty or not ready")]
    EmptyIndex,
    /// Build or add was called with no vectors or a zero dimension.
    #[error("input data is empty")]
    EmptyData,
    /// The supplied vectors do not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// An append would exceed the configured data capacity.
    #[error("memory overflow: capacity exceeded")]
    MemoryOverflow,
    /// A multi-stream operation received fewer streams than it requires.
    #[error("lack of inputs: required stream missing")]
    LackOfInputs,
    /// A persisted blob was rejected during load.
    #[error("failed to parse value: {0}")]
    FailedParseValue(String),
    /// The vector id does not exist or is already deleted.
    #[error("vector not found")]
    VectorNotFound,
    /// A streaming refine was interrupted by the abort probe.
    /// Partial outputs must be treated as invalid.
    #[error("operation aborted externally")]
    ExternalAbort,
    /// Underlying stream failure during save or load.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Unparseable parameter or similar misuse.
    #[error("{0}")]
    Fail(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
