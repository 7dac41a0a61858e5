//! Engine notifications.
//!
//! Components report progress and state changes as [`StreamEvent`] values
//! over an injected channel instead of a shared broadcast bus. A component
//! holds a cloneable [`EventBus`]; orchestrators and UIs consume the
//! receiving end. With no listener attached every emit is a no-op.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::memory::MemoryPressure;

/// Notification emitted by the streaming engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// File analysis finished.
    FileAnalyzed {
        total_lines: usize,
        total_chunks: usize,
    },
    /// Periodic analysis progress (every 10,000 lines).
    AnalysisProgress { lines_processed: usize },
    /// A chunk was transmitted successfully.
    ChunkCompleted { chunk_index: usize },
    /// A failed chunk was re-enqueued for another attempt.
    ChunkRetryQueued { chunk_index: usize, attempt: u32 },
    /// A chunk exhausted its retries and is permanently failed.
    ChunkFailed { chunk_index: usize, error: String },
    /// The processing loop paused at a chunk boundary.
    ProcessingPaused,
    /// The processing loop resumed.
    ProcessingResumed,
    /// Processing was stopped before completion.
    ProcessingStopped {
        processed_chunks: usize,
        failed_chunks: usize,
    },
    /// All chunks were drained.
    ProcessingCompleted {
        processed_chunks: usize,
        failed_chunks: usize,
    },
    /// Periodic memory sample.
    MemoryStatus {
        usage_bytes: u64,
        usage_fraction: f64,
        pressure: MemoryPressure,
    },
    /// Usage crossed the warning threshold.
    MemoryWarning { usage_bytes: u64 },
    /// Usage crossed the critical threshold.
    MemoryCritical { usage_bytes: u64 },
    /// A cleanup pass ran.
    MemoryOptimized { freed_entries: usize },
    /// A forced allocator-release pass ran.
    GarbageCollected,
    /// Sustained growth over recent samples suggests a leak.
    MemoryLeakDetected { growth_bytes: u64 },
    /// A checkpoint was created and stored.
    CheckpointCreated { id: String },
    /// A checkpoint was loaded and validated.
    CheckpointLoaded { id: String },
    /// A checkpoint was removed.
    CheckpointRemoved { id: String },
    /// All checkpoints for a source file were cleared.
    CheckpointsCleared { removed: usize },
    /// A graceful pause was requested; workers should reach a safe point.
    PauseRequested { reason: String },
    /// The pause executed.
    StreamPaused { reason: String },
    /// The resume executed.
    StreamResumed { pause_duration: Duration },
    /// A pause outlived its maximum duration and was force-resumed.
    PauseTimeoutExceeded { pause_duration: Duration },
}

/// Cloneable sender half for engine notifications.
///
/// Wraps an unbounded channel so emitting never suspends; a dropped
/// receiver silently discards events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl EventBus {
    /// Create a bus and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Create a bus that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Never fails; a missing or closed receiver is fine.
    pub fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
