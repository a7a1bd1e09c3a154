//! Append-only logical table.
//!
//! Records are addressed by strictly increasing offsets starting at `1`.
//! The table only keeps what has not yet been truncated: once the engine
//! reports an offset as durable, everything at or behind it may be dropped.

use std::collections::VecDeque;

use crate::record::{Offset, Record};
use crate::source::{SourceBatch, SourceError};

/// An in-memory, offset-addressed record log.
#[derive(Debug, Default)]
pub struct AppendOnlyTable {
    records: VecDeque<Record>,
    /// Highest offset dropped by truncation (0 = nothing dropped).
    truncated_through: Offset,
}

impl AppendOnlyTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, returning its offset.
    pub fn append(&mut self, record: Record) -> Offset {
        self.records.push_back(record);
        self.latest_offset()
    }

    /// Appends all records, returning the offset of the last one.
    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) -> Offset {
        self.records.extend(records);
        self.latest_offset()
    }

    /// Offset of the most recently appended record (0 if none ever was).
    #[must_use]
    pub fn latest_offset(&self) -> Offset {
        self.truncated_through + self.records.len() as Offset
    }

    /// Highest offset that has been truncated away.
    #[must_use]
    pub fn truncated_through(&self) -> Offset {
        self.truncated_through
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reads up to `max` records with offsets greater than `after`.
    ///
    /// Reading is side-effect free: the same `after` always yields the same
    /// records until they are truncated.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::OffsetOutOfRange`] if `after` is behind the
    /// truncation point or ahead of the latest offset.
    pub fn read_after(&self, after: Offset, max: usize) -> Result<SourceBatch, SourceError> {
        let latest = self.latest_offset();
        if after < self.truncated_through || after > latest {
            return Err(SourceError::OffsetOutOfRange {
                requested: after,
                earliest: self.truncated_through,
                latest,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let start = (after - self.truncated_through) as usize;
        let records: Vec<Record> = self.records.iter().skip(start).take(max).cloned().collect();
        let end_offset = after + records.len() as Offset;
        Ok(SourceBatch::new(records, end_offset))
    }

    /// Drops every record with offset `<= offset`.
    ///
    /// Offsets behind the current truncation point are ignored; offsets past
    /// the latest record are clamped.
    pub fn truncate_through(&mut self, offset: Offset) {
        let target = offset.min(self.latest_offset());
        if target <= self.truncated_through {
            return;
        }
        #[allow(clippy::cast_possible_truncation)]
        let drop = (target - self.truncated_through) as usize;
        self.records.drain(..drop);
        self.truncated_through = target;
    }
}
