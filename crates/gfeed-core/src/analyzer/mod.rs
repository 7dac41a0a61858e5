//! Source file analysis.
//!
//! Streams a G-code program line-by-line with bounded read buffering and
//! partitions it into fixed-size [`Chunk`]s with per-chunk complexity
//! scores, plus file-level metadata and aggregate statistics. The whole
//! file is never held in memory at once.

pub mod chunk;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, StreamEvent};

pub use chunk::{classify_line, Chunk, ChunkMetadata, LineClass};

/// Read buffer size for streaming analysis (64 KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lines between analysis progress notifications.
const PROGRESS_INTERVAL: usize = 10_000;

/// File-level metadata accumulated during analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    /// File contains comments (full-line or inline).
    pub has_comments: bool,
    /// File contains subprogram markers (M98/M99/O-word).
    pub has_subprograms: bool,
    /// Number of tool changes.
    pub tool_change_count: usize,
    /// Number of coordinate-system changes.
    pub coordinate_change_count: usize,
}

/// Aggregate statistics over the produced chunk sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkStatistics {
    /// Number of chunks produced.
    pub total_chunks: usize,
    /// Mean lines per chunk.
    pub average_chunk_size: f64,
    /// Largest chunk in lines.
    pub largest_chunk: usize,
    /// Smallest chunk in lines.
    pub smallest_chunk: usize,
    /// Sum of per-chunk complexity scores.
    pub total_complexity: f64,
}

impl ChunkStatistics {
    fn from_chunks(chunks: &[Chunk]) -> Self {
        let sizes: Vec<usize> = chunks.iter().map(Chunk::line_count).collect();
        let total_lines: usize = sizes.iter().sum();
        Self {
            total_chunks: chunks.len(),
            average_chunk_size: if chunks.is_empty() {
                0.0
            } else {
                total_lines as f64 / chunks.len() as f64
            },
            largest_chunk: sizes.iter().copied().max().unwrap_or(0),
            smallest_chunk: sizes.iter().copied().min().unwrap_or(0),
            total_complexity: chunks.iter().map(|c| c.metadata.complexity).sum(),
        }
    }
}

/// Result of analyzing one source file. Immutable after creation.
#[derive(Debug, Clone)]
pub struct FileAnalysis {
    /// Path of the analyzed file.
    pub file_path: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of lines that entered the chunk sequence.
    pub total_lines: usize,
    /// The ordered chunk sequence.
    pub chunks: Vec<Chunk>,
    /// File-level metadata.
    pub metadata: FileMetadata,
    /// Aggregate chunk statistics.
    pub statistics: ChunkStatistics,
    /// How long analysis took.
    pub analysis_time: Duration,
}

/// Streams a source file into bounded chunks.
pub struct FileAnalyzer {
    config: StreamConfig,
    events: EventBus,
}

impl FileAnalyzer {
    /// Create an analyzer with the given configuration.
    pub fn new(config: StreamConfig, events: EventBus) -> Self {
        Self { config, events }
    }

    /// Analyze a source file into an ordered chunk sequence.
    ///
    /// Fails with [`Error::Analysis`] when the file cannot be opened or
    /// read; everything else (including contiguity violations) is logged
    /// and never fatal.
    pub async fn analyze_file(&self, path: &Path) -> Result<FileAnalysis> {
        let file = tokio::fs::File::open(path).await.map_err(|e| Error::Analysis {
            message: format!("cannot open {}: {e}", path.display()),
        })?;
        let file_size = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default();

        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        self.analyze_stream(reader, path, file_size).await
    }

    /// Analyze an already-open line stream. Used directly by tests.
    pub async fn analyze_stream<R>(
        &self,
        mut reader: R,
        path: &Path,
        file_size: u64,
    ) -> Result<FileAnalysis>
    where
        R: AsyncBufRead + Unpin,
    {
        let started = Instant::now();
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut metadata = FileMetadata::default();
        let mut builder = chunk::ChunkBuilder::new(0, 1, 0);
        let mut kept_lines = 0usize;
        let mut raw_lines = 0usize;
        let mut byte_offset = 0u64;
        let mut buf = String::new();

        loop {
            buf.clear();
            let read = reader.read_line(&mut buf).await.map_err(|e| Error::Analysis {
                message: format!("read failed at line {}: {e}", raw_lines + 1),
            })?;
            if read == 0 {
                break;
            }
            raw_lines += 1;
            byte_offset += read as u64;

            if raw_lines % PROGRESS_INTERVAL == 0 {
                debug!(lines = raw_lines, "analysis progress");
                self.events.emit(StreamEvent::AnalysisProgress {
                    lines_processed: raw_lines,
                });
            }

            let line = buf.trim_end_matches(['\n', '\r']);

            if chunk::has_comment(line) {
                metadata.has_comments = true;
            }
            if chunk::is_subprogram_marker(line) {
                metadata.has_subprograms = true;
            }
            match chunk::classify_line(line) {
                LineClass::ToolChange => metadata.tool_change_count += 1,
                LineClass::CoordinateChange => metadata.coordinate_change_count += 1,
                _ => {}
            }

            if self.config.skip_empty_lines && line.trim().is_empty() {
                continue;
            }
            if self.config.skip_comments && chunk::is_comment_line(line) {
                continue;
            }

            builder.push(line.to_string());
            kept_lines += 1;

            if builder.len() >= self.config.chunk_size {
                let next_start = kept_lines + 1;
                let finished = builder.finish(byte_offset);
                builder = chunk::ChunkBuilder::new(finished.index + 1, next_start, byte_offset);
                chunks.push(finished);
            }
        }

        if !builder.is_empty() {
            chunks.push(builder.finish(byte_offset));
        }

        let statistics = ChunkStatistics::from_chunks(&chunks);
        validate_chunks(&chunks, kept_lines);

        let analysis_time = started.elapsed();
        debug!(
            path = %path.display(),
            total_lines = kept_lines,
            chunks = chunks.len(),
            elapsed_ms = analysis_time.as_millis() as u64,
            "file analyzed"
        );
        self.events.emit(StreamEvent::FileAnalyzed {
            total_lines: kept_lines,
            total_chunks: chunks.len(),
        });

        Ok(FileAnalysis {
            file_path: path.to_path_buf(),
            file_size,
            total_lines: kept_lines,
            chunks,
            metadata,
            statistics,
            analysis_time,
        })
    }
}

/// Check that the chunk sequence is contiguous and covers every line.
///
/// Violations indicate an analyzer bug; they are logged, never fatal.
/// Returns the number of violations found.
pub fn validate_chunks(chunks: &[Chunk], total_lines: usize) -> usize {
    let mut violations = 0;

    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i {
            warn!(expected = i, actual = chunk.index, "chunk index out of sequence");
            violations += 1;
        }
        if i == 0 && chunk.start_line != 1 {
            warn!(start_line = chunk.start_line, "first chunk does not start at line 1");
            violations += 1;
        }
        if i > 0 {
            let prev_end = chunks[i - 1].end_line;
            if chunk.start_line != prev_end + 1 {
                warn!(
                    chunk = chunk.index,
                    prev_end,
                    start_line = chunk.start_line,
                    "line continuity violation between chunks"
                );
                violations += 1;
            }
        }
    }

    if let Some(last) = chunks.last() {
        if last.end_line != total_lines {
            warn!(
                end_line = last.end_line,
                total_lines, "last chunk does not cover the final line"
            );
            violations += 1;
        }
    }

    violations
}
