//! # State Store Module
//!
//! Keyed storage for aggregate state.
//!
//! Keys and values are opaque bytes. The query engine encodes group keys and
//! aggregate states with rkyv and stores them here; the engine then commits
//! every batch's deltas together with a [`CommitMarker`] through
//! [`StateStore::write_batch`], so state and offsets always move together.
//!
//! ## State Backends
//!
//! - **[`InMemoryStore`]**: `BTreeMap`-based, key-sorted snapshots
//! - **`DurableStateStore`** (in `rill-storage`): in-memory map plus a batch
//!   write-ahead log and periodic checkpoints
//!
//! ## Example
//!
//! ```rust
//! use rill_core::state::{CommitMarker, InMemoryStore, StateStore, StateStoreExt, WriteBatch};
//!
//! let mut store = InMemoryStore::new();
//! store.put_typed(b"count", &42u64).unwrap();
//! let count: u64 = store.get_typed(b"count").unwrap().unwrap();
//! assert_eq!(count, 42);
//!
//! let mut batch = WriteBatch::new();
//! batch.put(b"a".to_vec(), b"1".to_vec());
//! batch.delete(b"count".to_vec());
//! batch.commit(CommitMarker::new(1, 10));
//! store.write_batch(batch).unwrap();
//!
//! assert!(store.get(b"count").is_none());
//! assert_eq!(store.last_commit().unwrap().end_offset, 10);
//!
//! let snapshot = store.snapshot();
//! store.clear();
//! store.restore(snapshot);
//! assert_eq!(store.get(b"a").unwrap().as_ref(), b"1");
//! ```

use bytes::Bytes;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use std::ops::Range;

mod memory;

pub use memory::InMemoryStore;

/// Trait for state store implementations.
///
/// Only the single active batch mutates a store, so implementations are
/// `Send` but need not be `Sync`.
///
/// # Dyn Compatibility
///
/// This trait is dyn-compatible for use with `Box<dyn StateStore>`. For
/// generic helpers like `get_typed` and `put_typed`, use [`StateStoreExt`].
pub trait StateStore: Send {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Store a key-value pair, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the backing storage rejects the write.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the backing storage rejects the write.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Scan all keys with a given prefix in lexicographic order.
    fn prefix_scan<'a>(&'a self, prefix: &'a [u8])
        -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Scan keys where `start <= key < end` in lexicographic order.
    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Check if a key exists.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Approximate size of keys and values in bytes.
    fn size_bytes(&self) -> usize;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Captures the current contents, key-sorted, with the last commit marker.
    fn snapshot(&self) -> StateSnapshot;

    /// Replaces the current contents with `snapshot`.
    fn restore(&mut self, snapshot: StateSnapshot);

    /// Clear all entries and the commit marker.
    fn clear(&mut self);

    /// Applies every operation in `batch`, then records its commit marker.
    ///
    /// Either the whole batch is applied or none of it is.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the batch could not be made durable. The
    /// store is unchanged in that case.
    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StateError>;

    /// Commit marker of the most recently applied batch.
    fn last_commit(&self) -> Option<&CommitMarker>;

    /// Commit marker that is guaranteed to survive a restart.
    ///
    /// `None` for stores with no durable backing.
    fn durable_commit(&self) -> Option<CommitMarker> {
        None
    }

    /// Flush pending state to durable storage.
    ///
    /// A no-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the flush fails.
    fn flush(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

/// Extension trait for [`StateStore`] providing typed access via rkyv.
pub trait StateStoreExt: StateStore {
    /// Get a value and deserialize it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Deserialization` if the bytes are not a valid
    /// archive of `T`.
    fn get_typed<T>(&self, key: &[u8]) -> Result<Option<T>, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        self.get(key).map(|bytes| decode(&bytes)).transpose()
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails.
    fn put_typed<T>(&mut self, key: &[u8], value: &T) -> Result<(), StateError>
    where
        T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let bytes = encode(value)?;
        self.put(key, &bytes)
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Serializes `value` with rkyv.
///
/// # Errors
///
/// Returns `StateError::Serialization` on failure.
pub fn encode<T>(value: &T) -> Result<AlignedVec, StateError>
where
    T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value).map_err(|e| StateError::Serialization(e.to_string()))
}

/// Validates and deserializes an rkyv archive of `T`.
///
/// The input is copied into an aligned buffer first, so slices taken from
/// arbitrary offsets (file frames, shared `Bytes`) decode correctly.
///
/// # Errors
///
/// Returns `StateError::Deserialization` if validation fails.
pub fn decode<T>(bytes: &[u8]) -> Result<T, StateError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = rkyv::access::<T::Archived, RkyvError>(&aligned)
        .map_err(|e| StateError::Deserialization(e.to_string()))?;
    rkyv::deserialize::<T, RkyvError>(archived)
        .map_err(|e| StateError::Deserialization(e.to_string()))
}

mod archived {
    #![allow(missing_docs)] // rkyv derive output

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// Marks a batch as committed: its id, the source offset it consumed
    /// through, and the watermarks it advanced.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct CommitMarker {
        /// Sequential batch id, starting at 1.
        pub batch_id: u64,
        /// Last source offset included in the batch.
        pub end_offset: u64,
        /// Event-time watermark per windowed output, `(output, millis)`.
        pub watermarks: Vec<(String, i64)>,
    }

    /// A single state mutation.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum WriteOp {
        /// Insert or overwrite a key.
        Put {
            /// Key bytes.
            key: Vec<u8>,
            /// Value bytes.
            value: Vec<u8>,
        },
        /// Remove a key.
        Delete {
            /// Key bytes.
            key: Vec<u8>,
        },
    }

    /// A snapshot of state store contents for checkpointing.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct StateSnapshot {
        /// Key-sorted entries.
        pub(super) data: Vec<(Vec<u8>, Vec<u8>)>,
        /// Last commit marker applied before the snapshot was taken.
        pub(super) commit: Option<CommitMarker>,
        /// Format version.
        pub(super) version: u32,
    }
}

pub use archived::{CommitMarker, StateSnapshot, WriteOp};

impl CommitMarker {
    /// Creates a marker with no watermarks.
    #[must_use]
    pub fn new(batch_id: u64, end_offset: u64) -> Self {
        Self {
            batch_id,
            end_offset,
            watermarks: Vec::new(),
        }
    }

    /// Adds watermarks to the marker.
    #[must_use]
    pub fn with_watermarks(mut self, watermarks: Vec<(String, i64)>) -> Self {
        self.watermarks = watermarks;
        self
    }

    /// Watermark recorded for `output`, if any.
    #[must_use]
    pub fn watermark(&self, output: &str) -> Option<i64> {
        self.watermarks
            .iter()
            .find(|(name, _)| name == output)
            .map(|(_, wm)| *wm)
    }
}

impl WriteOp {
    /// Key the operation touches.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// The state deltas of one batch plus its optional commit marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    commit: Option<CommitMarker>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    /// Sets the commit marker recorded with this batch.
    pub fn commit(&mut self, marker: CommitMarker) {
        self.commit = Some(marker);
    }

    /// Queued operations in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Commit marker, if set.
    #[must_use]
    pub fn commit_marker(&self) -> Option<&CommitMarker> {
        self.commit.as_ref()
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if no operations are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Splits the batch into its parts.
    #[must_use]
    pub fn into_parts(self) -> (Vec<WriteOp>, Option<CommitMarker>) {
        (self.ops, self.commit)
    }
}

impl StateSnapshot {
    /// Current snapshot format version.
    pub const VERSION: u32 = 1;

    /// Create a snapshot from key-value pairs. Entries are sorted by key.
    #[must_use]
    pub fn new(mut data: Vec<(Vec<u8>, Vec<u8>)>, commit: Option<CommitMarker>) -> Self {
        data.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            data,
            commit,
            version: Self::VERSION,
        }
    }

    /// Key-sorted entries.
    #[must_use]
    pub fn data(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.data
    }

    /// Commit marker captured with the snapshot.
    #[must_use]
    pub fn commit(&self) -> Option<&CommitMarker> {
        self.commit.as_ref()
    }

    /// Snapshot format version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate size of the entries in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Splits the snapshot into its entries and commit marker.
    #[must_use]
    pub fn into_parts(self) -> (Vec<(Vec<u8>, Vec<u8>)>, Option<CommitMarker>) {
        (self.data, self.commit)
    }

    /// Serialize the snapshot with rkyv.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<AlignedVec, StateError> {
        encode(self)
    }

    /// Deserialize a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        decode(bytes)
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Corruption error
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// Durable backing could not accept the write
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
