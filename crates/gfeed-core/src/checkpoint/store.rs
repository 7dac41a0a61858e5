//! Checkpoint storage backends.
//!
//! One [`CheckpointStore`] trait with memory and disk implementations;
//! validation and retention live in the manager so they are written once
//! regardless of backend. Records are opaque bytes here: plain JSON, or
//! zlib+base64 tagged with a `compressed:` prefix.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Prefix that marks a compressed record on disk.
const COMPRESSED_TAG: &str = "compressed:";

/// File extension for persisted checkpoint records.
const RECORD_EXT: &str = "ckpt";

/// A stored record with the id it was filed under.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Checkpoint id.
    pub id: String,
    /// Encoded record bytes.
    pub data: Vec<u8>,
}

/// Persistent backend for checkpoint records.
///
/// Ids sort newest-last lexically (they embed a millisecond timestamp),
/// so `list` implementations return records in descending id order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a record under `file_key`/`id`, replacing any existing one.
    async fn put(&self, file_key: &str, id: &str, record: &[u8]) -> Result<()>;

    /// All records for a source file, newest first.
    async fn list(&self, file_key: &str) -> Result<Vec<StoredRecord>>;

    /// Remove one record. Ok(false) if it did not exist.
    async fn remove(&self, file_key: &str, id: &str) -> Result<bool>;

    /// Remove every record for a source file, returning how many.
    async fn clear(&self, file_key: &str) -> Result<usize>;
}

/// Encode a serialized checkpoint for storage.
///
/// With compression enabled the JSON is deflated and base64-armored
/// behind a `compressed:` tag so loaders can tell the formats apart.
pub fn encode_record(json: &[u8], compress: bool) -> Result<Vec<u8>> {
    if !compress {
        return Ok(json.to_vec());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json)?;
    let deflated = encoder.finish()?;

    let mut out = COMPRESSED_TAG.as_bytes().to_vec();
    out.extend_from_slice(BASE64.encode(deflated).as_bytes());
    Ok(out)
}

/// Decode a stored record back to checkpoint JSON.
pub fn decode_record(data: &[u8]) -> Result<Vec<u8>> {
    let Some(tagged) = data.strip_prefix(COMPRESSED_TAG.as_bytes()) else {
        return Ok(data.to_vec());
    };
    let deflated = BASE64
        .decode(tagged)
        .map_err(|e| Error::Checkpoint {
            message: format!("invalid base64 in compressed record: {e}"),
        })?;
    let mut json = Vec::new();
    ZlibDecoder::new(&deflated[..])
        .read_to_end(&mut json)
        .map_err(|e| Error::Checkpoint {
            message: format!("invalid zlib in compressed record: {e}"),
        })?;
    Ok(json)
}

/// In-memory backend. Useful for tests and checkpoint-less embedders.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn put(&self, file_key: &str, id: &str, record: &[u8]) -> Result<()> {
        let mut records = self.records.lock().await;
        records
            .entry(file_key.to_string())
            .or_default()
            .insert(id.to_string(), record.to_vec());
        Ok(())
    }

    async fn list(&self, file_key: &str) -> Result<Vec<StoredRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(file_key)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .map(|(id, data)| StoredRecord {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, file_key: &str, id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(file_key)
            .is_some_and(|entries| entries.remove(id).is_some()))
    }

    async fn clear(&self, file_key: &str) -> Result<usize> {
        let mut records = self.records.lock().await;
        Ok(records.remove(file_key).map(|e| e.len()).unwrap_or(0))
    }
}

/// On-disk backend: one file per checkpoint id under a per-source-file
/// directory.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_dir(&self, file_key: &str) -> PathBuf {
        self.root.join(file_key)
    }

    fn record_path(&self, file_key: &str, id: &str) -> PathBuf {
        self.file_dir(file_key).join(format!("{id}.{RECORD_EXT}"))
    }
}

#[async_trait]
impl CheckpointStore for DiskStore {
    async fn put(&self, file_key: &str, id: &str, record: &[u8]) -> Result<()> {
        let dir = self.file_dir(file_key);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.record_path(file_key, id);
        tokio::fs::write(&path, record).await?;
        debug!(path = %path.display(), "checkpoint record written");
        Ok(())
    }

    async fn list(&self, file_key: &str) -> Result<Vec<StoredRecord>> {
        let dir = self.file_dir(file_key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        // Ids embed a fixed-width timestamp, so lexical order is age order
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let data = tokio::fs::read(self.record_path(file_key, &id)).await?;
            records.push(StoredRecord { id, data });
        }
        Ok(records)
    }

    async fn remove(&self, file_key: &str, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(file_key, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, file_key: &str) -> Result<usize> {
        let records = self.list(file_key).await?;
        let mut removed = 0;
        for record in &records {
            if self.remove(file_key, &record.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
