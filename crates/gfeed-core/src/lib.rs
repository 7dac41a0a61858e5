//! gfeed-core: Chunked G-code streaming and resume engine.
//!
//! This crate provides:
//! - Streaming file analysis into bounded, complexity-scored chunks
//! - Chunk processing with retry, timeout, and bounded concurrency
//! - Checksummed progress checkpoints with pluggable storage
//! - Cooperative pause/resume with a watchdog-bounded pause duration
//! - Host memory-pressure monitoring and adaptive chunk sizing
//! - Logging setup
//!
//! The engine never talks to a machine controller directly; it hands
//! each program line to an injected [`StreamingManager`].

pub mod analyzer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod memory;
pub mod pause;
pub mod processor;
pub mod streamer;

pub use analyzer::{Chunk, FileAnalysis, FileAnalyzer};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, ProgressSnapshot};
pub use config::StreamConfig;
pub use error::{Error, Result};
pub use events::{EventBus, StreamEvent};
pub use logging::{init_logging, LogFormat};
pub use memory::{MemoryManager, MemoryPressure};
pub use pause::{PauseController, PauseOutcome, ResumeOutcome};
pub use processor::{ChunkProcessor, ProcessingSummary};
pub use streamer::{LineContext, StreamingManager};
