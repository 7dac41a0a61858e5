//! Streaming engine configuration.
//!
//! One immutable [`StreamConfig`] is built at startup and passed by
//! reference to every component; nothing merges options at runtime.

use std::time::Duration;

/// Default lines per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default maximum in-flight chunks.
///
/// Kept at 1: typical controllers process one command at a time, so a
/// larger bound is only safe when the streaming manager serializes
/// physical sends internally.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 1;

/// Default per-chunk retry limit.
pub const DEFAULT_MAX_CHUNK_RETRIES: u32 = 3;

/// Default per-chunk processing timeout.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default host memory ceiling for pressure classification (512 MB).
pub const DEFAULT_MAX_MEMORY_USAGE: u64 = 512 * 1024 * 1024;

/// Configuration for the chunked streaming engine.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Lines per chunk produced by the analyzer.
    pub chunk_size: usize,
    /// Maximum chunks in flight simultaneously.
    pub max_concurrent_chunks: usize,
    /// Maximum retries before a chunk is reported permanently failed.
    pub max_chunk_retries: u32,
    /// Maximum processing time for a single chunk.
    pub chunk_timeout: Duration,
    /// Memory ceiling used for pressure classification (bytes).
    pub max_memory_usage: u64,
    /// Warning pressure threshold as a fraction of the ceiling.
    pub warning_threshold: f64,
    /// Critical pressure threshold as a fraction of the ceiling.
    pub critical_threshold: f64,
    /// Chunk-size reduction factor applied at critical pressure.
    pub critical_reduction_factor: f64,
    /// Interval between memory samples while monitoring.
    pub monitor_interval: Duration,
    /// Whether checkpointing is enabled at all.
    pub enable_checkpoints: bool,
    /// Compress persisted checkpoint records.
    pub compress_checkpoints: bool,
    /// Completed chunks between automatic checkpoints.
    pub checkpoint_interval: usize,
    /// Checkpoints retained per source file (newest kept).
    pub max_checkpoints: usize,
    /// Maximum age of a checkpoint before it is considered stale.
    pub retention_days: u64,
    /// Whether pause/resume is enabled.
    pub enable_pause_resume: bool,
    /// Wait for acknowledgement before pausing.
    pub enable_graceful_pause: bool,
    /// How long to wait for a pause acknowledgement.
    pub pause_ready_timeout: Duration,
    /// Maximum pause duration before a forced resume.
    pub max_pause_duration: Duration,
    /// Skip empty lines during analysis.
    pub skip_empty_lines: bool,
    /// Skip comment lines during analysis.
    pub skip_comments: bool,
    /// Reconcile line counts after each chunk completes.
    pub validate_completion: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_chunk_retries: DEFAULT_MAX_CHUNK_RETRIES,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            max_memory_usage: DEFAULT_MAX_MEMORY_USAGE,
            warning_threshold: 0.75,
            critical_threshold: 0.9,
            critical_reduction_factor: 0.5,
            monitor_interval: Duration::from_secs(5),
            enable_checkpoints: true,
            compress_checkpoints: false,
            checkpoint_interval: 10,
            max_checkpoints: 5,
            retention_days: 7,
            enable_pause_resume: true,
            enable_graceful_pause: true,
            pause_ready_timeout: Duration::from_secs(5),
            max_pause_duration: Duration::from_secs(30 * 60),
            skip_empty_lines: true,
            skip_comments: false,
            validate_completion: true,
        }
    }
}

impl StreamConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size in lines.
    pub fn with_chunk_size(mut self, lines: usize) -> Self {
        self.chunk_size = lines.max(1);
        self
    }

    /// Set the in-flight chunk bound.
    pub fn with_max_concurrent_chunks(mut self, max: usize) -> Self {
        self.max_concurrent_chunks = max.max(1);
        self
    }

    /// Set the per-chunk retry limit.
    pub fn with_max_chunk_retries(mut self, retries: u32) -> Self {
        self.max_chunk_retries = retries;
        self
    }

    /// Set the per-chunk timeout.
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Set the memory ceiling and pressure thresholds.
    pub fn with_memory_limits(mut self, max_usage: u64, warning: f64, critical: f64) -> Self {
        self.max_memory_usage = max_usage;
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    /// Set the checkpoint retention policy.
    pub fn with_checkpoint_retention(mut self, max_checkpoints: usize, retention_days: u64) -> Self {
        self.max_checkpoints = max_checkpoints;
        self.retention_days = retention_days;
        self
    }

    /// Set the maximum pause duration.
    pub fn with_max_pause_duration(mut self, duration: Duration) -> Self {
        self.max_pause_duration = duration;
        self
    }

    /// Disable checkpointing entirely.
    pub fn without_checkpoints(mut self) -> Self {
        self.enable_checkpoints = false;
        self
    }

    /// Usage fraction at which pressure becomes a warning.
    pub fn warning_bytes(&self) -> u64 {
        (self.max_memory_usage as f64 * self.warning_threshold) as u64
    }

    /// Usage fraction at which pressure becomes critical.
    pub fn critical_bytes(&self) -> u64 {
        (self.max_memory_usage as f64 * self.critical_threshold) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_concurrent_chunks, 1);
        assert_eq!(config.max_chunk_retries, 3);
        assert!(config.enable_checkpoints);
        assert!(config.warning_threshold < config.critical_threshold);
    }

    #[test]
    fn config_builder() {
        let config = StreamConfig::new()
            .with_chunk_size(500)
            .with_max_concurrent_chunks(4)
            .with_max_chunk_retries(5)
            .with_chunk_timeout(Duration::from_secs(10));

        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.max_concurrent_chunks, 4);
        assert_eq!(config.max_chunk_retries, 5);
        assert_eq!(config.chunk_timeout, Duration::from_secs(10));
    }

    #[test]
    fn config_clamps_zero_values() {
        let config = StreamConfig::new()
            .with_chunk_size(0)
            .with_max_concurrent_chunks(0);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.max_concurrent_chunks, 1);
    }

    #[test]
    fn threshold_bytes() {
        let config = StreamConfig::new().with_memory_limits(1000, 0.75, 0.9);
        assert_eq!(config.warning_bytes(), 750);
        assert_eq!(config.critical_bytes(), 900);
    }
}
