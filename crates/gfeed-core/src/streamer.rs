//! Streaming manager interface.
//!
//! The engine does not talk to the controller itself: it hands each
//! program line to an external [`StreamingManager`] and records the
//! outcome. Line-level transport, response correlation, and per-line
//! timeouts all live behind this trait.

use async_trait::async_trait;

use crate::error::Result;

/// Position of a line within the stream, passed alongside every send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineContext {
    /// 1-based line number in the source file.
    pub line_number: usize,
    /// Index of the chunk this line belongs to.
    pub chunk_index: usize,
    /// Whether this is the final line of its chunk.
    pub is_last_line_in_chunk: bool,
}

/// External collaborator that transmits one program line to the controller.
///
/// Callers may dispatch lines from several in-flight chunks concurrently.
/// Implementations driving real hardware that accepts one command at a
/// time must serialize physical sends internally, or the engine must be
/// configured with `max_concurrent_chunks = 1`.
#[async_trait]
pub trait StreamingManager: Send + Sync {
    /// Send one line to the controller and wait for its outcome.
    ///
    /// A failure carries a human-readable message; the engine records it
    /// per line and does not interpret the cause.
    async fn send_line(&self, line: &str, context: LineContext) -> Result<()>;
}
