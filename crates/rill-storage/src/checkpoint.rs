//! Checkpoint persistence via the [`CheckpointStore`] trait.
//!
//! A checkpoint is a full, key-sorted state snapshot plus the commit marker
//! it reflects. [`FileSystemCheckpointStore`] writes one file per checkpoint
//! and a `latest` pointer, both via temp file + fsync + rename.
//!
//! ## File format
//!
//! ```text
//! [magic "RILLCKPT": 8][version: u32 LE][crc32c(body): u32 LE][body: rkyv Checkpoint]
//! ```

use std::path::{Path, PathBuf};

use rill_core::state::{decode, encode, CommitMarker, StateSnapshot};

use crate::StorageError;

/// File magic.
pub const MAGIC: &[u8; 8] = b"RILLCKPT";

/// Current file format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;

mod checkpoint_types {
    #![allow(missing_docs)] // rkyv derive output

    use rill_core::state::StateSnapshot;
    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// A persisted state snapshot.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct Checkpoint {
        /// Checkpoint id; the batch id of the snapshot's commit, or 0.
        pub id: u64,
        /// Wall-clock creation time in milliseconds since the epoch.
        pub created_at_ms: u64,
        /// The state and its commit marker.
        pub snapshot: StateSnapshot,
    }
}

pub use checkpoint_types::Checkpoint;

impl Checkpoint {
    /// Wraps a snapshot, taking the id from its commit marker.
    #[must_use]
    pub fn new(snapshot: StateSnapshot) -> Self {
        let id = snapshot.commit().map_or(0, |c| c.batch_id);
        let created_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            id,
            created_at_ms,
            snapshot,
        }
    }

    /// Commit marker the checkpoint reflects.
    #[must_use]
    pub fn commit(&self) -> Option<&CommitMarker> {
        self.snapshot.commit()
    }

    /// Serializes into the checkpoint file format.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::State` if encoding fails.
    pub fn to_file_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let body = encode(self)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses the checkpoint file format.
    ///
    /// `origin` names the file in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] if the magic, checksum or body is
    /// invalid, and [`StorageError::UnsupportedVersion`] for other versions.
    pub fn from_file_bytes(bytes: &[u8], origin: &str) -> Result<Self, StorageError> {
        let corrupt = |reason: String| StorageError::Corruption {
            path: origin.to_string(),
            reason,
        };
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt(format!("file too short ({} bytes)", bytes.len())));
        }
        if &bytes[..8] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let expected = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let body = &bytes[HEADER_SIZE..];
        if crc32c::crc32c(body) != expected {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        decode::<Checkpoint>(body).map_err(|e| corrupt(e.to_string()))
    }
}

/// Fsync a file to ensure its contents are durable on disk.
fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

/// Fsync a directory to make rename operations durable.
#[allow(clippy::unnecessary_wraps)] // Returns Result on Unix, no-op elsewhere
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Writes `data` to `path` atomically: temp file, fsync, rename, dir fsync.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    sync_file(&tmp)?;
    std::fs::rename(&tmp, path)?;
    sync_dir(dir)
}

/// Trait for checkpoint persistence backends.
///
/// Implementations must guarantee atomic writes: readers never observe a
/// partial checkpoint, and the latest pointer only moves after the
/// checkpoint it names is durable.
pub trait CheckpointStore: Send + Sync {
    /// Persists a checkpoint and makes it the latest.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O or encoding failure.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Loads the most recent checkpoint, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] if the latest checkpoint fails
    /// validation. Older checkpoints are never substituted silently.
    fn load_latest(&self) -> Result<Option<Checkpoint>, StorageError>;

    /// Loads a checkpoint by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure or corruption.
    fn load_by_id(&self, id: u64) -> Result<Option<Checkpoint>, StorageError>;

    /// Lists checkpoint ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    fn list(&self) -> Result<Vec<u64>, StorageError>;

    /// Removes all but the `keep_count` most recent checkpoints, returning
    /// how many were removed. The checkpoint that is currently the latest
    /// is never removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    fn prune(&self, keep_count: usize) -> Result<usize, StorageError>;
}

/// Filesystem-backed checkpoint store.
///
/// Checkpoints live under `{base_dir}/checkpoints/` as
/// `checkpoint_{id:012}` files, with a `latest` text pointer.
#[derive(Debug, Clone)]
pub struct FileSystemCheckpointStore {
    base_dir: PathBuf,
    max_retained: usize,
}

impl FileSystemCheckpointStore {
    /// Creates a store rooted at `base_dir`, keeping at most `max_retained`
    /// checkpoints (0 keeps all). Directories are created on first save.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_retained,
        }
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    fn checkpoint_path(&self, id: u64) -> PathBuf {
        self.checkpoints_dir().join(format!("checkpoint_{id:012}"))
    }

    fn latest_path(&self) -> PathBuf {
        self.checkpoints_dir().join("latest")
    }

    fn parse_checkpoint_id(name: &str) -> Option<u64> {
        name.strip_prefix("checkpoint_").and_then(|s| s.parse().ok())
    }

    /// Id named by the `latest` pointer, if it is readable.
    fn latest_id(&self) -> Option<u64> {
        std::fs::read_to_string(self.latest_path())
            .ok()
            .and_then(|content| Self::parse_checkpoint_id(content.trim()))
    }

    fn discard_after(&self, id: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for newer in self.list()?.into_iter().filter(|&other| other > id) {
            std::fs::remove_file(self.checkpoint_path(newer))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(checkpoint_id = id, removed, "discarded superseded checkpoints");
        }
        Ok(removed)
    }
}

impl CheckpointStore for FileSystemCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let dir = self.checkpoints_dir();
        std::fs::create_dir_all(&dir)?;

        let bytes = checkpoint.to_file_bytes()?;
        write_atomic(&self.checkpoint_path(checkpoint.id), &bytes)?;
        write_atomic(
            &self.latest_path(),
            format!("checkpoint_{:012}", checkpoint.id).as_bytes(),
        )?;

        tracing::info!(
            checkpoint_id = checkpoint.id,
            entries = checkpoint.snapshot.len(),
            bytes = bytes.len(),
            "checkpoint written"
        );

        // Checkpoints with higher ids than the one just written belong to a
        // history that a restore or clear replaced
        if let Err(e) = self.discard_after(checkpoint.id) {
            tracing::warn!(error = %e, "failed to discard superseded checkpoints");
        }
        if self.max_retained > 0 {
            if let Err(e) = self.prune(self.max_retained) {
                tracing::warn!(error = %e, "failed to prune old checkpoints");
            }
        }
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<Checkpoint>, StorageError> {
        let latest = self.latest_path();
        if !latest.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&latest)?;
        let name = content.trim();
        match Self::parse_checkpoint_id(name) {
            Some(id) => match self.load_by_id(id)? {
                Some(checkpoint) => Ok(Some(checkpoint)),
                None => Err(StorageError::Corruption {
                    path: latest.display().to_string(),
                    reason: format!("points at missing {name}"),
                }),
            },
            None => Err(StorageError::Corruption {
                path: latest.display().to_string(),
                reason: format!("unparseable pointer '{name}'"),
            }),
        }
    }

    fn load_by_id(&self, id: u64) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.checkpoint_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Checkpoint::from_file_bytes(&bytes, &path.display().to_string()).map(Some)
    }

    fn list(&self) -> Result<Vec<u64>, StorageError> {
        let dir = self.checkpoints_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<u64> = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().and_then(Self::parse_checkpoint_id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn prune(&self, keep_count: usize) -> Result<usize, StorageError> {
        let latest = self.latest_id();
        let mut ids = self.list()?;
        if ids.len() <= keep_count {
            return Ok(0);
        }
        // The checkpoint `latest` names always survives and counts as kept
        ids.retain(|&id| Some(id) != latest);
        let keep_others = keep_count.saturating_sub(usize::from(latest.is_some()));
        let excess = ids.len().saturating_sub(keep_others);
        let mut removed = 0;
        for &id in &ids[..excess] {
            if std::fs::remove_file(self.checkpoint_path(id)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(batch_id: u64) -> Checkpoint {
        let data = vec![
            (b"b".to_vec(), b"2".to_vec()),
            (b"a".to_vec(), b"1".to_vec()),
        ];
        Checkpoint::new(StateSnapshot::new(
            data,
            Some(CommitMarker::new(batch_id, batch_id * 100)),
        ))
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 10);
        assert!(store.load_latest().unwrap().is_none());

        store.save(&checkpoint(1)).unwrap();
        store.save(&checkpoint(2)).unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.commit().unwrap().end_offset, 200);
        assert_eq!(latest.snapshot.data()[0].0, b"a".to_vec());
        assert_eq!(store.load_by_id(1).unwrap().unwrap().id, 1);
        assert!(store.load_by_id(9).unwrap().is_none());
    }

    #[test]
    fn test_auto_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 2);
        for id in 1..=5 {
            store.save(&checkpoint(id)).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![4, 5]);
        assert_eq!(store.load_latest().unwrap().unwrap().id, 5);
    }

    #[test]
    fn test_older_save_replaces_newer_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 3);
        for id in 1..=4 {
            store.save(&checkpoint(id)).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![2, 3, 4]);

        store.save(&checkpoint(1)).unwrap();
        assert_eq!(store.list().unwrap(), vec![1]);
        assert_eq!(store.load_latest().unwrap().unwrap().id, 1);
    }

    #[test]
    fn test_prune_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 0);
        for id in [5, 6, 7] {
            store.save(&checkpoint(id)).unwrap();
        }
        std::fs::write(dir.path().join("checkpoints").join("latest"), "checkpoint_000000000005")
            .unwrap();

        assert_eq!(store.prune(1).unwrap(), 2);
        assert_eq!(store.list().unwrap(), vec![5]);
        assert_eq!(store.load_latest().unwrap().unwrap().id, 5);
    }

    #[test]
    fn test_corrupted_checkpoint_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 0);
        store.save(&checkpoint(1)).unwrap();

        let path = dir.path().join("checkpoints").join("checkpoint_000000000001");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.load_latest(),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn test_header_validation() {
        let bytes = checkpoint(3).to_file_bytes().unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(Checkpoint::from_file_bytes(&bytes, "t").unwrap().id, 3);

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Checkpoint::from_file_bytes(&bad_magic, "t"),
            Err(StorageError::Corruption { .. })
        ));

        let mut future = bytes.clone();
        future[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Checkpoint::from_file_bytes(&future, "t"),
            Err(StorageError::UnsupportedVersion(9))
        ));

        assert!(Checkpoint::from_file_bytes(&bytes[..10], "t").is_err());
    }

    #[test]
    fn test_dangling_latest_pointer_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCheckpointStore::new(dir.path(), 0);
        store.save(&checkpoint(1)).unwrap();
        std::fs::remove_file(dir.path().join("checkpoints").join("checkpoint_000000000001"))
            .unwrap();
        assert!(store.load_latest().is_err());
    }
}
