//! Processing state and run summaries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Live state of a processing run. Mutated only by the chunk processor.
///
/// Invariants: `processed_chunks + failed_chunks <= total_chunks`;
/// `current_chunk_index` only advances, except on explicit reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingState {
    /// A run is active.
    pub is_processing: bool,
    /// The run is parked at a chunk boundary.
    pub is_paused: bool,
    /// Index one past the highest completed chunk.
    pub current_chunk_index: usize,
    /// Chunks in the run.
    pub total_chunks: usize,
    /// Chunks completed successfully.
    pub processed_chunks: usize,
    /// Chunks permanently failed.
    pub failed_chunks: usize,
    /// When the run started.
    pub started_at: Option<Instant>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::idle()
    }
}

impl ProcessingState {
    /// State with no run in progress.
    pub fn idle() -> Self {
        Self {
            is_processing: false,
            is_paused: false,
            current_chunk_index: 0,
            total_chunks: 0,
            processed_chunks: 0,
            failed_chunks: 0,
            started_at: None,
        }
    }

    /// State at the start of a run over `total_chunks` chunks.
    pub fn started(total_chunks: usize) -> Self {
        Self {
            is_processing: true,
            is_paused: false,
            current_chunk_index: 0,
            total_chunks,
            processed_chunks: 0,
            failed_chunks: 0,
            started_at: Some(Instant::now()),
        }
    }

    /// Fraction of chunks finished (completed or permanently failed).
    pub fn progress_fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.processed_chunks + self.failed_chunks) as f64 / self.total_chunks as f64
    }

    /// Whether every chunk has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.processed_chunks + self.failed_chunks >= self.total_chunks
    }
}

/// A line the streaming manager failed to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFailure {
    /// 1-based source line number.
    pub line_number: usize,
    /// Human-readable failure message from the streaming manager.
    pub message: String,
}

/// Final accounting for a processing run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSummary {
    /// Chunks in the run.
    pub total_chunks: usize,
    /// Chunks completed successfully.
    pub processed_chunks: usize,
    /// Chunks permanently failed.
    pub failed_chunks: usize,
    /// Indexes of permanently failed chunks.
    pub failed_chunk_indexes: Vec<usize>,
    /// Retry attempts recorded per chunk index.
    pub retry_attempts: HashMap<usize, u32>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// The run was stopped before draining every chunk.
    pub stopped: bool,
}

impl ProcessingSummary {
    /// Whether every chunk completed successfully.
    pub fn is_complete_success(&self) -> bool {
        !self.stopped && self.failed_chunks == 0 && self.processed_chunks == self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_state() {
        let state = ProcessingState::idle();
        assert!(!state.is_processing);
        assert_eq!(state.progress_fraction(), 0.0);
        assert!(state.is_finished()); // zero of zero
    }

    #[test]
    fn started_state() {
        let state = ProcessingState::started(10);
        assert!(state.is_processing);
        assert_eq!(state.total_chunks, 10);
        assert!(state.started_at.is_some());
        assert!(!state.is_finished());
    }

    #[test]
    fn progress_fraction_counts_terminal_chunks() {
        let mut state = ProcessingState::started(10);
        state.processed_chunks = 4;
        state.failed_chunks = 1;
        assert!((state.progress_fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_success() {
        let summary = ProcessingSummary {
            total_chunks: 3,
            processed_chunks: 3,
            failed_chunks: 0,
            failed_chunk_indexes: vec![],
            retry_attempts: HashMap::new(),
            elapsed: Duration::from_secs(1),
            stopped: false,
        };
        assert!(summary.is_complete_success());

        let stopped = ProcessingSummary {
            stopped: true,
            ..summary
        };
        assert!(!stopped.is_complete_success());
    }
}
