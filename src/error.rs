//! Error handling utilities shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Convenient result type used throughout the crate.
pub type Result<T, E = UnipieceError> = std::result::Result<T, E>;

/// Domain-specific error describing failures during configuration, training,
/// or segmentation.
#[derive(Debug, Error)]
pub enum UnipieceError {
    /// Malformed input or an out-of-range parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An id outside the vocabulary was requested.
    #[error("id {id} is out of range (vocab size {vocab_size})")]
    OutOfRange {
        /// The offending id.
        id: usize,
        /// Current vocabulary size.
        vocab_size: usize,
    },
    /// Invariant violation: missing UNK, duplicate piece, unreachable lattice.
    #[error("internal error: {0}")]
    Internal(String),
    /// Suffix-array construction failed.
    #[error("suffix array unavailable: {0}")]
    Unavailable(String),
    /// Unsupported configuration combination.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    /// Corrupt serialized model.
    #[error("corrupt model data: {0}")]
    DataLoss(String),
    /// Filesystem IO error with optional context path.
    #[error("io error while processing {path:?}: {source}")]
    Io {
        /// Underlying IO error returned by the standard library.
        source: std::io::Error,
        /// Target path associated with the IO failure if available.
        path: Option<PathBuf>,
    },
}

impl From<serde_json::Error> for UnipieceError {
    fn from(err: serde_json::Error) -> Self {
        Self::DataLoss(err.to_string())
    }
}

impl UnipieceError {
    /// Helper constructor that attaches an optional path when wrapping IO errors.
    pub fn io(source: std::io::Error, path: Option<PathBuf>) -> Self {
        Self::Io { source, path }
    }
}
