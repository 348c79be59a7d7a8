use thiserror::Error;

use crate::source::FetchError;
use crate::state::ChunkState;

pub type Result<T, E = VecfetchError> = std::result::Result<T, E>;

/// Errors are `Clone` so every caller waiting on an in-flight chunk can be
/// handed the owner's outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VecfetchError {
    #[error("invalid byte range [{start}, {end})")]
    InvalidRange { start: i128, end: i128 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("merkle tree does not match target: expected {expected}, found {found}")]
    TreeMismatch { expected: String, found: String },

    #[error("chunk {index}: fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        index: u32,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("chunk {index}: content hash mismatch after {attempts} attempt(s)")]
    ChunkCorrupt { index: u32, attempts: u32 },

    #[error("range end {end} exceeds content size {total_size}")]
    RangeOutOfBounds { end: u64, total_size: u64 },

    #[error("{context}: {message}")]
    Io { context: String, message: String },

    /// A local read or write while settling a chunk. Never retried.
    #[error("chunk {index}: {context}: {message}")]
    LocalIo { index: u32, context: String, message: String },

    #[error("malformed sidecar: {0}")]
    Format(String),

    #[error("chunk {index}: illegal state transition {from:?} -> {to:?}")]
    IllegalTransition { index: u32, from: ChunkState, to: ChunkState },

    #[error("{0} is locked by another process")]
    Locked(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl VecfetchError {
    pub(crate) fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        VecfetchError::Io { context: context.into(), message: err.to_string() }
    }

    /// Attach the chunk being settled to a local I/O failure.
    pub(crate) fn for_chunk(self, index: u32) -> Self {
        match self {
            VecfetchError::Io { context, message } => VecfetchError::LocalIo { index, context, message },
            other => other,
        }
    }

    /// Chunk index named by this error, if it concerns a single chunk.
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            VecfetchError::Fetch { index, .. }
            | VecfetchError::ChunkCorrupt { index, .. }
            | VecfetchError::LocalIo { index, .. }
            | VecfetchError::IllegalTransition { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// `ctx` helper for `std::io::Result`, in the spirit of `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn ctx(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn ctx(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| VecfetchError::io(context(), e))
    }
}
