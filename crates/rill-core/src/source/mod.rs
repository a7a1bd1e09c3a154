//! # Source Adapters
//!
//! A source hands the engine bounded slices of an append-only record log.
//!
//! ## Contract
//!
//! - `poll(last_offset, max)` returns the records with offsets in
//!   `(last_offset, end_offset]`, at most `max` of them. Polling is free of
//!   side effects, so a failed batch can poll the same range again.
//! - No new data is an empty batch, never an error.
//! - `commit(offset)` tells the source everything up to `offset` is durable
//!   downstream and may be dropped.
//! - The schema is fixed at construction. The engine validates every record
//!   against it and never coerces.
//!
//! Background ingestion (socket readers, producer threads) lives inside the
//! adapter and meets the engine through a bounded queue; see
//! [`ChannelSource`].

use async_trait::async_trait;

use crate::record::{Offset, Record};
use crate::schema::{SchemaError, SchemaRef};

mod channel;
mod memory;

pub use channel::{ChannelSource, ChannelSourceHandle};
pub use memory::{MemorySource, MemorySourceHandle};

/// Records returned by one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    /// Records in offset order.
    pub records: Vec<Record>,
    /// Offset of the last record, or the requested offset when empty.
    pub end_offset: Offset,
}

impl SourceBatch {
    /// Creates a batch.
    #[must_use]
    pub fn new(records: Vec<Record>, end_offset: Offset) -> Self {
        Self {
            records,
            end_offset,
        }
    }

    /// An empty batch ending at `offset`.
    #[must_use]
    pub fn empty(offset: Offset) -> Self {
        Self::new(Vec::new(), offset)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records were returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Poll-based source of records.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Name used in logs and progress reports.
    fn name(&self) -> &str;

    /// Schema every record conforms to.
    fn schema(&self) -> SchemaRef;

    /// Returns up to `max_records` records after `last_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] for transient failures and
    /// [`SourceError::OffsetOutOfRange`] if `last_offset` was truncated.
    async fn poll(
        &mut self,
        last_offset: Offset,
        max_records: usize,
    ) -> Result<SourceBatch, SourceError>;

    /// True once the source will never produce records beyond those it
    /// has already returned or still holds.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Allows the source to drop records up to and including `offset`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError` if the source cannot record the commit.
    async fn commit(&mut self, _offset: Offset) -> Result<(), SourceError> {
        Ok(())
    }

    /// Releases resources. Further polls fail with [`SourceError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns `SourceError` if cleanup fails.
    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Errors raised by sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transient failure; polling again later may succeed
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Requested offset is not retained
    #[error("offset {requested} out of range (retained {earliest}..={latest})")]
    OffsetOutOfRange {
        /// Offset the caller asked to read after.
        requested: Offset,
        /// Truncation point.
        earliest: Offset,
        /// Latest offset.
        latest: Offset,
    },

    /// Source was closed
    #[error("source closed")]
    Closed,

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input could not be turned into records of the declared schema
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl SourceError {
    /// Whether retrying the poll may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Io(_))
    }
}
