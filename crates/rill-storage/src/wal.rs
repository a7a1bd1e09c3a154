//! Per-batch write-ahead log.
//!
//! Every committed batch is logged as one record before it is applied to
//! memory, so a batch is either entirely in the log or not at all.
//!
//! Record format: `[length: u32 LE][crc32c: u32 LE][rkyv BatchRecord]`
//!
//! On open, a partial record at the end of the file (a crash mid-append) is
//! discarded and the file truncated back to the last complete record. A
//! complete record whose checksum does not match is corruption and fails
//! the open.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rill_core::state::{decode, encode, CommitMarker, StateError, WriteBatch, WriteOp};

use crate::StorageError;

/// Size of the record header (length + CRC32C).
const RECORD_HEADER_SIZE: usize = 8;

mod wal_types {
    #![allow(missing_docs)] // rkyv derive output

    use rill_core::state::{CommitMarker, WriteOp};
    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// One logged unit: the writes of a committed batch, or writes made
    /// directly on the store outside any batch (`commit` is `None`).
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct BatchRecord {
        /// Writes in application order.
        pub ops: Vec<WriteOp>,
        /// Commit marker of the batch.
        pub commit: Option<CommitMarker>,
    }
}

pub use wal_types::BatchRecord;

impl BatchRecord {
    /// Record of a write batch.
    #[must_use]
    pub fn from_batch(batch: &WriteBatch) -> Self {
        Self {
            ops: batch.ops().to_vec(),
            commit: batch.commit_marker().cloned(),
        }
    }

    /// Record of a single write made outside a batch.
    #[must_use]
    pub fn single(op: WriteOp) -> Self {
        Self {
            ops: vec![op],
            commit: None,
        }
    }

    /// Batch id of the commit marker, if any.
    #[must_use]
    pub fn batch_id(&self) -> Option<u64> {
        self.commit.as_ref().map(|c| c.batch_id)
    }

    /// Commit marker, if any.
    #[must_use]
    pub fn commit(&self) -> Option<&CommitMarker> {
        self.commit.as_ref()
    }

    /// Rebuilds the write batch.
    #[must_use]
    pub fn into_write_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for op in self.ops {
            match op {
                WriteOp::Put { key, value } => batch.put(key, value),
                WriteOp::Delete { key } => batch.delete(key),
            }
        }
        if let Some(marker) = self.commit {
            batch.commit(marker);
        }
        batch
    }
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct LogContents {
    /// Complete, verified records in log order.
    pub records: Vec<BatchRecord>,
    /// Length of the verified prefix.
    pub valid_len: u64,
    /// Whether a partial record followed the verified prefix.
    pub torn_tail: bool,
}

/// Append-only log of batch records.
#[derive(Debug)]
pub struct BatchLog {
    path: PathBuf,
    file: File,
    position: u64,
    sync_on_write: bool,
}

impl BatchLog {
    /// Opens (or creates) the log at `path`, returning the records it holds.
    ///
    /// A torn tail is truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] if a complete record fails its
    /// checksum or cannot be decoded, and `Io` on file errors.
    pub fn open(
        path: impl AsRef<Path>,
        sync_on_write: bool,
    ) -> Result<(Self, Vec<BatchRecord>), StorageError> {
        let path = path.as_ref().to_path_buf();
        let contents = if path.exists() {
            Self::read(&path)?
        } else {
            LogContents::default()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if contents.torn_tail {
            tracing::warn!(
                path = %path.display(),
                valid_len = contents.valid_len,
                "discarding torn record at end of batch log"
            );
            file.set_len(contents.valid_len)?;
            file.sync_all()?;
        }

        let log = Self {
            path,
            file,
            position: contents.valid_len,
            sync_on_write,
        };
        Ok((log, contents.records))
    }

    /// Reads and verifies every record in the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] on a checksum or decode failure.
    pub fn read(path: &Path) -> Result<LogContents, StorageError> {
        let data = std::fs::read(path)?;
        let mut contents = LogContents::default();
        let mut pos = 0usize;

        while pos < data.len() {
            let remaining = data.len() - pos;
            if remaining < RECORD_HEADER_SIZE {
                contents.torn_tail = true;
                break;
            }
            let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            let expected_crc =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            if remaining - RECORD_HEADER_SIZE < len {
                contents.torn_tail = true;
                break;
            }

            let body = &data[pos + RECORD_HEADER_SIZE..pos + RECORD_HEADER_SIZE + len];
            if crc32c::crc32c(body) != expected_crc {
                return Err(StorageError::Corruption {
                    path: path.display().to_string(),
                    reason: format!("checksum mismatch in record at byte {pos}"),
                });
            }
            let record = decode::<BatchRecord>(body).map_err(|e| StorageError::Corruption {
                path: path.display().to_string(),
                reason: format!("undecodable record at byte {pos}: {e}"),
            })?;

            contents.records.push(record);
            pos += RECORD_HEADER_SIZE + len;
        }

        contents.valid_len = pos as u64;
        Ok(contents)
    }

    /// Appends a record, returning its starting position.
    ///
    /// If the write fails the file is truncated back to the previous end, so
    /// a failed append never leaves a partial record behind.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on encoding or I/O failure.
    pub fn append(&mut self, record: &BatchRecord) -> Result<u64, StorageError> {
        let bytes = encode(record)?;
        let len = u32::try_from(bytes.len()).map_err(|_| {
            StateError::Serialization(format!("batch record of {} bytes", bytes.len()))
        })?;

        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&bytes).to_le_bytes());
        frame.extend_from_slice(&bytes);

        let start = self.position;
        if let Err(e) = self.write_frame(&frame) {
            if let Err(undo) = self.file.set_len(start) {
                tracing::error!(error = %undo, position = start, "failed to truncate partial batch record");
            }
            return Err(e.into());
        }
        self.position += frame.len() as u64;
        Ok(start)
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Forces appended records to disk.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the sync fails.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drops every record, typically after a checkpoint covers them.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be truncated.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.position = 0;
        Ok(())
    }

    /// Current end of the log in bytes.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether every append is synced before returning.
    #[must_use]
    pub fn syncs_on_write(&self) -> bool {
        self.sync_on_write
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(batch_id: u64, key: &[u8]) -> BatchRecord {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), b"v".to_vec());
        batch.commit(CommitMarker::new(batch_id, batch_id * 10));
        BatchRecord::from_batch(&batch)
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let (mut log, records) = BatchLog::open(&path, true).unwrap();
        assert!(records.is_empty());
        assert_eq!(log.append(&record(1, b"a")).unwrap(), 0);
        let second = log.append(&record(2, b"b")).unwrap();
        assert!(second > 0);
        drop(log);

        let (log, records) = BatchLog::open(&path, true).unwrap();
        assert_eq!(records, vec![record(1, b"a"), record(2, b"b")]);
        assert_eq!(log.position(), std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let (mut log, _) = BatchLog::open(&path, true).unwrap();
        log.append(&record(1, b"a")).unwrap();
        let good_len = log.position();
        log.append(&record(2, b"b")).unwrap();
        drop(log);

        // Cut the second record in half
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + 10).unwrap();
        drop(file);

        let (mut log, records) = BatchLog::open(&path, true).unwrap();
        assert_eq!(records, vec![record(1, b"a")]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // Appends continue after the verified prefix
        log.append(&record(2, b"c")).unwrap();
        drop(log);
        let (_, records) = BatchLog::open(&path, true).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], record(2, b"c"));
    }

    #[test]
    fn test_partial_header_is_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let (log, records) = BatchLog::open(&path, false).unwrap();
        assert!(records.is_empty());
        assert_eq!(log.position(), 0);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let (mut log, _) = BatchLog::open(&path, true).unwrap();
        log.append(&record(1, b"a")).unwrap();
        drop(log);

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            BatchLog::open(&path, true),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let (mut log, _) = BatchLog::open(&path, false).unwrap();
        log.append(&record(1, b"a")).unwrap();
        log.sync().unwrap();
        log.reset().unwrap();
        assert_eq!(log.position(), 0);
        log.append(&record(2, b"b")).unwrap();
        drop(log);

        let (_, records) = BatchLog::open(&path, false).unwrap();
        assert_eq!(records, vec![record(2, b"b")]);
    }

    #[test]
    fn test_round_trip_to_write_batch() {
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        batch.delete(b"old".to_vec());
        batch.commit(CommitMarker::new(4, 40));
        let rebuilt = BatchRecord::from_batch(&batch).into_write_batch();
        assert_eq!(rebuilt, batch);
    }
}
