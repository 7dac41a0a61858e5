//! Error types for gfeed-core.

use thiserror::Error;

/// Main error type for gfeed operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source file could not be opened or parsed into chunks.
    #[error("analysis error: {message}")]
    Analysis { message: String },

    /// A chunk exceeded its maximum processing time.
    #[error("chunk {chunk_index} timed out after {timeout_ms}ms")]
    ChunkTimeout { chunk_index: usize, timeout_ms: u64 },

    /// Aggregated per-line failures within a chunk.
    #[error("chunk {chunk_index} execution failed: {failed_lines} of {total_lines} lines")]
    ChunkExecution {
        chunk_index: usize,
        failed_lines: usize,
        total_lines: usize,
    },

    /// The streaming manager reported a line-send failure.
    #[error("streaming error: {message}")]
    Streaming { message: String },

    /// Checkpoint persistence failed (storage-level, not corruption).
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    /// A processing run is already in progress.
    #[error("processing already in progress")]
    AlreadyProcessing,

    /// Serialization of a checkpoint record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this error is recoverable via the chunk retry path.
    ///
    /// Recoverable errors leave the rest of the run intact - the failing
    /// chunk is re-enqueued until the retry limit is reached.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ChunkTimeout { .. } | Error::ChunkExecution { .. } | Error::Streaming { .. }
        )
    }

    /// Returns true if this error prevents a run from starting at all.
    ///
    /// Fatal errors are surfaced synchronously to the caller of
    /// `analyze_file`/`start_processing`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Analysis { .. } | Error::AlreadyProcessing | Error::Io(_)
        )
    }
}

/// Convenience result type for gfeed operations.
pub type Result<T> = std::result::Result<T, Error>;
