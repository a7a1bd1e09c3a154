//! Durable state store: in-memory map + batch WAL + periodic checkpoints.
//!
//! Every committed batch is appended to the [`BatchLog`] before it touches
//! memory. Every `snapshot_interval` batches the full state is written as a
//! [`Checkpoint`] and the log is reset.
//!
//! Recovery loads the latest checkpoint and replays the log records that
//! are newer than it. With the WAL disabled only checkpoints survive a
//! restart, and [`durable_commit`](StateStore::durable_commit) reports the
//! checkpoint's marker so the engine can replay the source from there.

use std::ops::Range;
use std::path::PathBuf;

use bytes::Bytes;
use rill_core::state::{
    CommitMarker, InMemoryStore, StateError, StateSnapshot, StateStore, WriteBatch, WriteOp,
};

use crate::checkpoint::{Checkpoint, CheckpointStore, FileSystemCheckpointStore};
use crate::wal::{BatchLog, BatchRecord};
use crate::StorageError;

/// Configuration for [`DurableStateStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableStoreConfig {
    /// Directory holding the log and checkpoints.
    pub dir: PathBuf,
    /// Committed batches between checkpoints (0 = only on flush).
    pub snapshot_interval: u64,
    /// Whether batches are logged before they are applied.
    pub wal_enabled: bool,
    /// Whether each log append is fsynced before the commit returns.
    pub sync_on_commit: bool,
    /// Checkpoints kept on disk (0 = all).
    pub retained_snapshots: usize,
}

impl DurableStoreConfig {
    /// Defaults rooted at `dir`: WAL on, synced commits, a checkpoint every
    /// 10 batches, 3 checkpoints retained.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            snapshot_interval: 10,
            wal_enabled: true,
            sync_on_commit: true,
            retained_snapshots: 3,
        }
    }

    /// Sets the checkpoint interval in batches.
    #[must_use]
    pub fn with_snapshot_interval(mut self, batches: u64) -> Self {
        self.snapshot_interval = batches;
        self
    }

    /// Enables or disables the write-ahead log.
    #[must_use]
    pub fn with_wal(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    /// Enables or disables fsync on every commit.
    #[must_use]
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets how many checkpoints are kept.
    #[must_use]
    pub fn with_retained_snapshots(mut self, count: usize) -> Self {
        self.retained_snapshots = count;
        self
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join("wal.log")
    }
}

/// What recovery found when the store was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Id of the checkpoint restored, if any.
    pub checkpoint_id: Option<u64>,
    /// Committed batches replayed from the log.
    pub replayed_batches: usize,
    /// Log records skipped because the checkpoint already covered them.
    pub skipped_records: usize,
}

/// State store that survives restarts.
pub struct DurableStateStore {
    config: DurableStoreConfig,
    memory: InMemoryStore,
    wal: Option<BatchLog>,
    checkpoints: Box<dyn CheckpointStore>,
    durable: Option<CommitMarker>,
    batches_since_checkpoint: u64,
    needs_checkpoint: bool,
    recovery: RecoveryInfo,
}

impl std::fmt::Debug for DurableStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStateStore")
            .field("config", &self.config)
            .field("entries", &self.memory.len())
            .field("durable", &self.durable)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl DurableStateStore {
    /// Opens the store in `config.dir`, recovering any previous state.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] if the latest checkpoint or a
    /// complete log record fails validation. Nothing is partially restored.
    pub fn open(config: DurableStoreConfig) -> Result<Self, StorageError> {
        let checkpoints =
            FileSystemCheckpointStore::new(config.dir.clone(), config.retained_snapshots);
        Self::open_with(config, Box::new(checkpoints))
    }

    /// Opens the store with a custom checkpoint backend.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with(
        config: DurableStoreConfig,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.dir)?;
        let mut memory = InMemoryStore::new();
        let mut recovery = RecoveryInfo::default();

        let checkpointed_batch = match checkpoints.load_latest()? {
            Some(checkpoint) => {
                recovery.checkpoint_id = Some(checkpoint.id);
                let batch = checkpoint.commit().map_or(0, |c| c.batch_id);
                memory.restore(checkpoint.snapshot);
                batch
            }
            None => 0,
        };

        let wal = if config.wal_enabled {
            let (log, records) = BatchLog::open(config.wal_path(), config.sync_on_commit)?;
            Self::replay(&mut memory, records, checkpointed_batch, &mut recovery, &log)?;
            Some(log)
        } else {
            None
        };

        let durable = memory.last_commit().cloned();
        tracing::info!(
            dir = %config.dir.display(),
            checkpoint_id = ?recovery.checkpoint_id,
            replayed_batches = recovery.replayed_batches,
            batch_id = durable.as_ref().map_or(0, |c| c.batch_id),
            offset = durable.as_ref().map_or(0, |c| c.end_offset),
            entries = memory.len(),
            "durable state store recovered"
        );

        Ok(Self {
            config,
            memory,
            wal,
            checkpoints,
            durable,
            batches_since_checkpoint: 0,
            needs_checkpoint: false,
            recovery,
        })
    }

    /// Applies the log records newer than the checkpoint.
    ///
    /// Records up to the last one committed at or before the checkpoint's
    /// batch are already reflected in it.
    fn replay(
        memory: &mut InMemoryStore,
        records: Vec<BatchRecord>,
        checkpointed_batch: u64,
        recovery: &mut RecoveryInfo,
        log: &BatchLog,
    ) -> Result<(), StorageError> {
        let covered = records
            .iter()
            .rposition(|r| r.batch_id().is_some_and(|id| id <= checkpointed_batch))
            .map_or(0, |i| i + 1);
        recovery.skipped_records = covered;

        let mut last_batch = checkpointed_batch;
        for record in records.into_iter().skip(covered) {
            if let Some(id) = record.batch_id() {
                if id <= last_batch {
                    return Err(StorageError::Corruption {
                        path: log.path().display().to_string(),
                        reason: format!("batch {id} logged after batch {last_batch}"),
                    });
                }
                last_batch = id;
                recovery.replayed_batches += 1;
            }
            memory.write_batch(record.into_write_batch())?;
        }
        Ok(())
    }

    /// Writes a checkpoint now and resets the log.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the checkpoint cannot be written.
    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        let checkpoint = Checkpoint::new(self.memory.snapshot());
        self.checkpoints.save(&checkpoint)?;
        if let Some(wal) = &mut self.wal {
            wal.reset()?;
        }
        self.durable = self.memory.last_commit().cloned();
        self.batches_since_checkpoint = 0;
        self.needs_checkpoint = false;
        Ok(())
    }

    /// What recovery found when the store was opened.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryInfo {
        &self.recovery
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &DurableStoreConfig {
        &self.config
    }

    fn log_single(&mut self, op: WriteOp) -> Result<(), StorageError> {
        if self.needs_checkpoint {
            self.checkpoint()?;
        }
        if let Some(wal) = &mut self.wal {
            wal.append(&BatchRecord::single(op))?;
        }
        Ok(())
    }
}

impl StateStore for DurableStateStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.memory.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.log_single(WriteOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.memory.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.log_single(WriteOp::Delete { key: key.to_vec() })?;
        self.memory.delete(key)
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.memory.prefix_scan(prefix)
    }

    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.memory.range_scan(range)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.memory.contains(key)
    }

    fn size_bytes(&self) -> usize {
        self.memory.size_bytes()
    }

    fn len(&self) -> usize {
        self.memory.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.memory.snapshot()
    }

    /// Replaces the contents; the next write or flush checkpoints them.
    fn restore(&mut self, snapshot: StateSnapshot) {
        self.memory.restore(snapshot);
        self.needs_checkpoint = true;
    }

    fn clear(&mut self) {
        self.memory.clear();
        self.needs_checkpoint = true;
    }

    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StateError> {
        if self.needs_checkpoint {
            self.checkpoint()?;
        }
        if let Some(wal) = &mut self.wal {
            wal.append(&BatchRecord::from_batch(&batch))?;
        }

        let commit = batch.commit_marker().cloned();
        self.memory.write_batch(batch)?;

        if let Some(commit) = commit {
            self.batches_since_checkpoint += 1;
            let batch_id = commit.batch_id;
            if self.wal.as_ref().is_some_and(BatchLog::syncs_on_write) {
                self.durable = Some(commit);
            }
            if self.config.snapshot_interval > 0
                && self.batches_since_checkpoint >= self.config.snapshot_interval
            {
                // The batch is already committed; a failed checkpoint is retried
                // after the next batch.
                if let Err(e) = self.checkpoint() {
                    tracing::warn!(batch_id, error = %e, "checkpoint failed");
                }
            }
        }
        Ok(())
    }

    fn last_commit(&self) -> Option<&CommitMarker> {
        self.memory.last_commit()
    }

    fn durable_commit(&self) -> Option<CommitMarker> {
        self.durable.clone()
    }

    fn flush(&mut self) -> Result<(), StateError> {
        if let Some(wal) = &mut self.wal {
            wal.sync()?;
        }
        self.checkpoint()?;
        Ok(())
    }
}
