//! Progress checkpointing for crash and interruption recovery.
//!
//! Snapshots of processing progress are checksummed, kept in an
//! in-memory index, and persisted through a pluggable
//! [`CheckpointStore`] backend. Reload validates every candidate and
//! silently skips corrupt or stale ones - a bad checkpoint is treated as
//! absent, never as a fatal error.

pub mod store;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::config::StreamConfig;
use crate::error::Result;
use crate::events::{EventBus, StreamEvent};

pub use store::{CheckpointStore, DiskStore, MemoryStore};

/// Progress figures captured in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Index of the next chunk to process.
    pub current_chunk: usize,
    /// Total chunks in the run.
    pub total_chunks: usize,
    /// Last line reached (1-based).
    pub current_line: usize,
    /// Total lines in the run.
    pub total_lines: usize,
    /// Bytes of the source file covered so far.
    pub bytes_processed: u64,
    /// Source file size in bytes.
    pub total_bytes: u64,
    /// Run start, unix milliseconds.
    pub started_at: u64,
    /// Pause start if the run was paused, unix milliseconds.
    pub paused_at: Option<u64>,
}

/// A persisted, checksum-verified snapshot of processing progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id; embeds a fixed-width millisecond timestamp so ids sort
    /// by age.
    pub id: String,
    /// Creation time, unix milliseconds.
    pub timestamp: u64,
    /// Source file this checkpoint belongs to.
    pub file_path: String,
    /// The progress snapshot.
    pub snapshot: ProgressSnapshot,
    /// Caller-supplied chunk/metric metadata.
    pub metadata: serde_json::Value,
    /// xxh64 over the rest of the record.
    pub checksum: u64,
}

impl Checkpoint {
    /// Compute the integrity checksum over every field except `checksum`.
    ///
    /// xxh64 of the canonical JSON encoding with the checksum zeroed;
    /// deterministic, non-cryptographic, detects incidental corruption.
    pub fn compute_checksum(&self) -> u64 {
        let mut unsummed = self.clone();
        unsummed.checksum = 0;
        // Struct field order is fixed and serde_json maps are sorted, so
        // this encoding is canonical.
        let json = serde_json::to_vec(&unsummed).expect("checkpoint always serializes");
        xxh64(&json, 0)
    }

    /// Whether the stored checksum matches a recomputation.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a stored candidate was rejected during load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateDefect {
    ChecksumMismatch,
    Stale,
}

/// Creates, persists, and reloads progress checkpoints.
pub struct CheckpointManager {
    config: StreamConfig,
    events: EventBus,
    store: Arc<dyn CheckpointStore>,
    index: Mutex<HashMap<String, Vec<Checkpoint>>>,
    seq: AtomicU64,
}

impl CheckpointManager {
    /// Create a manager persisting through the given backend.
    pub fn new(config: StreamConfig, events: EventBus, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            config,
            events,
            store,
            index: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Create a manager writing under `root` on disk.
    pub fn on_disk(config: StreamConfig, events: EventBus, root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(config, events, Arc::new(DiskStore::new(root)))
    }

    /// Snapshot progress into a new checkpoint.
    ///
    /// Returns `Ok(None)` when checkpointing is disabled. The record goes
    /// into the in-memory index and - unless `persist` is false - the
    /// backend; both sets are then pruned to the retention count.
    pub async fn create_checkpoint(
        &self,
        file_path: &Path,
        snapshot: ProgressSnapshot,
        metadata: serde_json::Value,
        persist: bool,
    ) -> Result<Option<Checkpoint>> {
        if !self.config.enable_checkpoints {
            return Ok(None);
        }

        let timestamp = now_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut checkpoint = Checkpoint {
            id: format!("ckpt-{timestamp:013}-{seq:04}"),
            timestamp,
            file_path: file_path.to_string_lossy().into_owned(),
            snapshot,
            metadata,
            checksum: 0,
        };
        checkpoint.checksum = checkpoint.compute_checksum();

        let file_key = file_key(file_path);
        {
            let mut index = self.index.lock().await;
            let entries = index.entry(file_key.clone()).or_default();
            entries.push(checkpoint.clone());
            // Newest kept; entries are appended in creation order
            while entries.len() > self.config.max_checkpoints {
                entries.remove(0);
            }
        }

        if persist {
            let json = serde_json::to_vec(&checkpoint)?;
            let record = store::encode_record(&json, self.config.compress_checkpoints)?;
            self.store.put(&file_key, &checkpoint.id, &record).await?;
            self.prune_store(&file_key).await?;
        }

        debug!(id = %checkpoint.id, chunk = checkpoint.snapshot.current_chunk, "checkpoint created");
        self.events.emit(StreamEvent::CheckpointCreated {
            id: checkpoint.id.clone(),
        });
        Ok(Some(checkpoint))
    }

    /// Load the newest valid checkpoint for a source file.
    ///
    /// Prefers the in-memory index; otherwise scans the backend newest
    /// first, skipping any candidate that fails to parse, fails checksum
    /// recomputation, or is older than the retention window.
    pub async fn load_checkpoint(&self, file_path: &Path) -> Result<Option<Checkpoint>> {
        let file_key = file_key(file_path);

        {
            let index = self.index.lock().await;
            if let Some(entries) = index.get(&file_key) {
                for checkpoint in entries.iter().rev() {
                    match self.inspect(checkpoint) {
                        Ok(()) => {
                            self.events.emit(StreamEvent::CheckpointLoaded {
                                id: checkpoint.id.clone(),
                            });
                            return Ok(Some(checkpoint.clone()));
                        }
                        Err(defect) => {
                            debug!(id = %checkpoint.id, ?defect, "in-memory checkpoint rejected");
                        }
                    }
                }
            }
        }

        for record in self.store.list(&file_key).await? {
            let checkpoint = match store::decode_record(&record.data)
                .and_then(|json| serde_json::from_slice::<Checkpoint>(&json).map_err(Into::into))
            {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    debug!(id = %record.id, error = %e, "unreadable checkpoint candidate skipped");
                    continue;
                }
            };
            match self.inspect(&checkpoint) {
                Ok(()) => {
                    info!(id = %checkpoint.id, chunk = checkpoint.snapshot.current_chunk, "checkpoint loaded");
                    self.events.emit(StreamEvent::CheckpointLoaded {
                        id: checkpoint.id.clone(),
                    });
                    return Ok(Some(checkpoint));
                }
                Err(defect) => {
                    debug!(id = %checkpoint.id, ?defect, "checkpoint candidate rejected");
                }
            }
        }

        Ok(None)
    }

    /// Remove one checkpoint from the index and the backend.
    pub async fn remove_checkpoint(&self, file_path: &Path, id: &str) -> Result<bool> {
        let file_key = file_key(file_path);
        let in_memory = {
            let mut index = self.index.lock().await;
            index
                .get_mut(&file_key)
                .is_some_and(|entries| {
                    let before = entries.len();
                    entries.retain(|c| c.id != id);
                    entries.len() != before
                })
        };
        let on_store = self.store.remove(&file_key, id).await?;

        let removed = in_memory || on_store;
        if removed {
            self.events.emit(StreamEvent::CheckpointRemoved { id: id.to_string() });
        }
        Ok(removed)
    }

    /// Remove every checkpoint for a source file.
    pub async fn clear_checkpoints(&self, file_path: &Path) -> Result<usize> {
        let file_key = file_key(file_path);
        let in_memory = {
            let mut index = self.index.lock().await;
            index.remove(&file_key).map(|e| e.len()).unwrap_or(0)
        };
        let on_store = self.store.clear(&file_key).await?;

        let removed = in_memory.max(on_store);
        self.events.emit(StreamEvent::CheckpointsCleared { removed });
        Ok(removed)
    }

    /// Number of checkpoints currently indexed for a source file.
    pub async fn indexed_count(&self, file_path: &Path) -> usize {
        let index = self.index.lock().await;
        index.get(&file_key(file_path)).map(Vec::len).unwrap_or(0)
    }

    fn inspect(&self, checkpoint: &Checkpoint) -> std::result::Result<(), CandidateDefect> {
        if !checkpoint.is_valid() {
            return Err(CandidateDefect::ChecksumMismatch);
        }
        let max_age_ms = self.config.retention_days * 24 * 60 * 60 * 1000;
        if now_millis().saturating_sub(checkpoint.timestamp) > max_age_ms {
            return Err(CandidateDefect::Stale);
        }
        Ok(())
    }

    async fn prune_store(&self, file_key: &str) -> Result<()> {
        let records = self.store.list(file_key).await?;
        for stale in records.iter().skip(self.config.max_checkpoints) {
            self.store.remove(file_key, &stale.id).await?;
        }
        Ok(())
    }
}

/// Stable per-source-file storage key: file stem plus a path hash, so
/// same-named files in different directories do not collide.
fn file_key(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let hash = xxh64(path.to_string_lossy().as_bytes(), 0);
    format!("{stem}-{hash:016x}")
}
