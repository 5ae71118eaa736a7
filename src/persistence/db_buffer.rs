//! DB Write Buffer
//!
//! Bounded in-memory holding area for writes that could not reach the
//! database, backed by a write-ahead log so a crash loses nothing that
//! `add` accepted.
//!
//! Bounds are checked against the canonical JSON serialization of each
//! entry's `data` (UTF-8 byte length); the counters use the same number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::sink::BufferSink;
use super::wal::WriteAheadLog;
use crate::error::{Result, SentinelError};

/// Buffer shared between the failing writer and the flusher.
///
/// `add` and `flush_to_db` both go through the mutex and never interleave.
pub type SharedDbBuffer = Arc<Mutex<DbWriteBuffer>>;

/// Configuration for the write buffer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbBufferConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// WAL location; `None` keeps the buffer memory-only
    #[serde(default)]
    pub wal_path: Option<PathBuf>,
    /// Sync the WAL after every append
    #[serde(default)]
    pub fsync: bool,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for DbBufferConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            wal_path: None,
            fsync: false,
        }
    }
}

impl DbBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(SentinelError::validation(
                "db_buffer.max_entries must be greater than 0",
            ));
        }
        if self.max_bytes == 0 {
            return Err(SentinelError::validation(
                "db_buffer.max_bytes must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// A database write waiting to be flushed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    resource_type: String,
    resource_id: String,
    data: serde_json::Map<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    seq_no: Option<u64>,
    #[serde(default)]
    idempotent_key: String,
}

impl BufferEntry {
    /// New unsequenced entry; the buffer assigns `seq_no` on `add`
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            data,
            timestamp: Utc::now(),
            seq_no: None,
            idempotent_key: String::new(),
        }
    }

    /// Pin the sequence number (and with it the idempotent key)
    pub fn with_seq(mut self, seq_no: u64) -> Self {
        self.idempotent_key = format!("{}:{}:{}", self.resource_type, self.resource_id, seq_no);
        self.seq_no = Some(seq_no);
        self
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn seq_no(&self) -> Option<u64> {
        self.seq_no
    }

    /// `resource_type:resource_id:seq_no`, empty until sequenced
    pub fn idempotent_key(&self) -> &str {
        &self.idempotent_key
    }

    /// Byte size used for the buffer bounds
    pub fn serialized_size(&self) -> Result<usize> {
        Ok(serde_json::to_vec(&self.data)?.len())
    }
}

pub struct DbWriteBuffer {
    config: DbBufferConfig,
    entries: Vec<BufferEntry>,
    byte_count: usize,
    next_seq: u64,
    wal: Option<WriteAheadLog>,
}

impl DbWriteBuffer {
    /// Build the buffer, replaying the WAL if one is configured.
    ///
    /// Replay only rebuilds local state. Every deduplicated record is
    /// restored, even past the configured limits.
    pub fn new(config: DbBufferConfig) -> Result<Self> {
        let wal = config
            .wal_path
            .as_ref()
            .map(|path| WriteAheadLog::new(path, config.fsync));

        let mut buffer = Self {
            config,
            entries: Vec::new(),
            byte_count: 0,
            next_seq: 0,
            wal,
        };

        if let Some(wal) = &buffer.wal {
            let replay = wal.load()?;
            for entry in replay.entries {
                buffer.byte_count += entry.serialized_size()?;
                if let Some(seq) = entry.seq_no() {
                    buffer.next_seq = buffer.next_seq.max(seq + 1);
                }
                buffer.entries.push(entry);
            }

            if !buffer.entries.is_empty() {
                info!(
                    entries = buffer.entries.len(),
                    bytes = buffer.byte_count,
                    duplicates = replay.records.saturating_sub(buffer.entries.len()),
                    "Restored buffered writes from WAL"
                );
            }
            if buffer.is_full() {
                warn!(
                    entries = buffer.entries.len(),
                    bytes = buffer.byte_count,
                    "Replayed buffer exceeds configured limits"
                );
            }
        }

        Ok(buffer)
    }

    /// Wrap for sharing between tasks
    pub fn into_shared(self) -> SharedDbBuffer {
        Arc::new(Mutex::new(self))
    }

    /// Hold a write. `Ok(false)` means the buffer is at capacity and nothing
    /// changed. The WAL record is written before the entry is held.
    ///
    /// An entry whose idempotent key is already held replaces it in place,
    /// matching what WAL replay keeps; capacity is checked against the net
    /// change.
    pub fn add(&mut self, entry: BufferEntry) -> Result<bool> {
        let size = entry.serialized_size()?;
        let entry = match entry.seq_no() {
            Some(_) => entry,
            None => entry.with_seq(self.next_seq),
        };

        let existing = self
            .entries
            .iter()
            .position(|e| e.idempotent_key() == entry.idempotent_key());
        let (entries_after, bytes_after) = match existing {
            Some(pos) => (
                self.entries.len(),
                self.byte_count - self.entries[pos].serialized_size()? + size,
            ),
            None => (self.entries.len() + 1, self.byte_count + size),
        };

        if entries_after > self.config.max_entries || bytes_after > self.config.max_bytes {
            warn!(
                resource_type = entry.resource_type(),
                resource_id = entry.resource_id(),
                entries = self.entries.len(),
                bytes = self.byte_count,
                entry_bytes = size,
                "DB write buffer full, entry rejected"
            );
            return Ok(false);
        }

        if let Some(wal) = &self.wal {
            wal.append(&entry)?;
        }

        if let Some(seq) = entry.seq_no() {
            self.next_seq = self.next_seq.max(seq + 1);
        }
        debug!(
            key = entry.idempotent_key(),
            bytes = size,
            replaced = existing.is_some(),
            "Buffered DB write"
        );
        self.byte_count = bytes_after;
        match existing {
            Some(pos) => self.entries[pos] = entry,
            None => self.entries.push(entry),
        }
        Ok(true)
    }

    /// Drain everything to `sink`, then clear memory and truncate the WAL.
    ///
    /// On sink failure nothing is cleared; the error is returned and the
    /// entries stay for the next attempt.
    pub async fn flush_to_db(&mut self, sink: &dyn BufferSink) -> Result<usize> {
        if self.entries.is_empty() {
            return Ok(0);
        }

        sink.write_batch(&self.entries).await?;

        if let Some(wal) = &self.wal {
            wal.truncate()?;
        }

        let flushed = self.entries.len();
        self.entries.clear();
        self.byte_count = 0;

        info!(flushed, "Flushed DB write buffer");
        Ok(flushed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.config.max_entries || self.byte_count >= self.config.max_bytes
    }

    pub fn entries(&self) -> &[BufferEntry] {
        &self.entries
    }

    pub fn config(&self) -> &DbBufferConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_byte_count_uses_canonical_json() {
        let mut buffer = DbWriteBuffer::new(DbBufferConfig::default()).unwrap();
        let payload = data(json!({ "k": "v" }));
        let expected = serde_json::to_vec(&payload).unwrap().len();

        assert!(buffer.add(BufferEntry::new("fill", "1", payload)).unwrap());
        assert_eq!(buffer.byte_count(), expected);
    }

    #[test]
    fn test_rejects_over_max_bytes() {
        let mut buffer = DbWriteBuffer::new(DbBufferConfig {
            max_bytes: 10,
            ..Default::default()
        })
        .unwrap();

        let big = data(json!({ "payload": "0123456789" }));
        assert!(!buffer.add(BufferEntry::new("fill", "1", big)).unwrap());
        assert_eq!(buffer.entry_count(), 0);
        assert_eq!(buffer.byte_count(), 0);
    }

    #[test]
    fn test_assigns_sequence_numbers() {
        let mut buffer = DbWriteBuffer::new(DbBufferConfig::default()).unwrap();
        buffer
            .add(BufferEntry::new("order", "o-1", data(json!({}))))
            .unwrap();
        buffer
            .add(BufferEntry::new("order", "o-1", data(json!({}))))
            .unwrap();

        let keys: Vec<&str> = buffer.entries().iter().map(|e| e.idempotent_key()).collect();
        assert_eq!(keys, vec!["order:o-1:0", "order:o-1:1"]);
    }

    #[test]
    fn test_sequence_resumes_after_replay() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbBufferConfig {
            wal_path: Some(dir.path().join("buffer.wal")),
            ..Default::default()
        };

        let mut buffer = DbWriteBuffer::new(config.clone()).unwrap();
        buffer
            .add(BufferEntry::new("order", "o-1", data(json!({}))).with_seq(7))
            .unwrap();
        drop(buffer);

        let mut buffer = DbWriteBuffer::new(config).unwrap();
        buffer
            .add(BufferEntry::new("order", "o-2", data(json!({}))))
            .unwrap();
        assert_eq!(buffer.entries()[1].seq_no(), Some(8));
    }

    #[test]
    fn test_config_validation() {
        let config = DbBufferConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_validation());
    }
}
