//! Write-ahead log for buffered database writes
//!
//! Newline-delimited JSON, one `BufferEntry` per line. Appends only during
//! normal operation; truncated to empty after a successful flush.
//!
//! `load` is pure deserialization plus last-write-wins dedup by idempotent
//! key. It never calls back into anything downstream.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::db_buffer::BufferEntry;
use crate::error::Result;

/// Result of reading a WAL file
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Deduplicated entries in first-seen order
    pub entries: Vec<BufferEntry>,
    /// Total well-formed records read
    pub records: usize,
    /// Lines that failed to parse
    pub skipped: usize,
}

impl WalReplay {
    /// Records that were superseded by a later write with the same key
    pub fn duplicates(&self) -> usize {
        self.records - self.entries.len()
    }
}

#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    fsync: bool,
}

impl WriteAheadLog {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Returns only after the line has been written
    /// (and synced, when `fsync` is on).
    pub fn append(&self, entry: &BufferEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Read and dedupe every record in the log.
    ///
    /// A missing file is an empty log.
    pub fn load(&self) -> Result<WalReplay> {
        Self::load_path(&self.path)
    }

    pub fn load_path(path: &Path) -> Result<WalReplay> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No WAL file, nothing to replay");
                return Ok(WalReplay::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut replay = WalReplay::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: BufferEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        "Skipping malformed WAL record: {}",
                        e
                    );
                    replay.skipped += 1;
                    continue;
                }
            };

            replay.records += 1;
            match index.get(entry.idempotent_key()) {
                Some(&pos) => replay.entries[pos] = entry,
                None => {
                    index.insert(entry.idempotent_key().to_string(), replay.entries.len());
                    replay.entries.push(entry);
                }
            }
        }

        info!(
            path = %path.display(),
            records = replay.records,
            entries = replay.entries.len(),
            skipped = replay.skipped,
            "WAL loaded"
        );
        Ok(replay)
    }

    /// Empty the log
    pub fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, seq: u64, value: i64) -> BufferEntry {
        let data = json!({ "value": value });
        BufferEntry::new("order", id, data.as_object().cloned().unwrap_or_default())
            .with_seq(seq)
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path().join("missing.wal"), false);
        let replay = wal.load().unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.records, 0);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path().join("buffer.wal"), false);

        wal.append(&entry("a", 1, 10)).unwrap();
        wal.append(&entry("b", 1, 20)).unwrap();
        wal.append(&entry("a", 1, 11)).unwrap();

        let replay = wal.load().unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.duplicates(), 1);
        assert_eq!(replay.entries[0].idempotent_key(), "order:a:1");
        assert_eq!(replay.entries[0].data()["value"], json!(11));
    }

    #[test]
    fn test_torn_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.wal");
        let wal = WriteAheadLog::new(&path, false);
        wal.append(&entry("a", 1, 10)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"resource_type\":\"ord").unwrap();

        let replay = wal.load().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.skipped, 1);
    }

    #[test]
    fn test_truncate_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.wal");
        let wal = WriteAheadLog::new(&path, true);
        wal.append(&entry("a", 1, 10)).unwrap();

        wal.truncate().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
