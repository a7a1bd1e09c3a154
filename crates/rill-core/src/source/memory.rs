//! In-memory source fed through a handle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SourceAdapter, SourceBatch, SourceError};
use crate::record::{records_from_arrow, Offset, Record};
use crate::schema::SchemaRef;
use crate::table::AppendOnlyTable;

#[derive(Debug, Default)]
struct Shared {
    table: AppendOnlyTable,
    closed: bool,
}

/// Source over an in-memory table that drivers append to.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    schema: SchemaRef,
    shared: Arc<Mutex<Shared>>,
}

/// Appends records to a [`MemorySource`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemorySourceHandle {
    schema: SchemaRef,
    shared: Arc<Mutex<Shared>>,
}

impl MemorySource {
    /// Creates a source and the handle that feeds it.
    #[must_use]
    pub fn new(schema: SchemaRef) -> (Self, MemorySourceHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let source = Self {
            name: "memory".to_string(),
            schema: Arc::clone(&schema),
            shared: Arc::clone(&shared),
        };
        (source, MemorySourceHandle { schema, shared })
    }

    /// Sets the source name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl MemorySourceHandle {
    /// Appends one record, returning its offset.
    ///
    /// Records are not validated here; the engine rejects mismatches.
    pub fn push(&self, record: Record) -> Offset {
        self.shared.lock().table.append(record)
    }

    /// Appends records, returning the offset of the last one.
    pub fn push_all(&self, records: impl IntoIterator<Item = Record>) -> Offset {
        self.shared.lock().table.extend(records)
    }

    /// Appends the rows of an Arrow batch.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Schema`] if the batch cannot be converted.
    pub fn push_record_batch(
        &self,
        batch: &arrow_array::RecordBatch,
    ) -> Result<Offset, SourceError> {
        let (_, records) = records_from_arrow(batch)?;
        Ok(self.push_all(records))
    }

    /// Declared schema of the source.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Latest appended offset.
    #[must_use]
    pub fn latest_offset(&self) -> Offset {
        self.shared.lock().table.latest_offset()
    }

    /// Number of records not yet truncated.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.shared.lock().table.len()
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    async fn poll(
        &mut self,
        last_offset: Offset,
        max_records: usize,
    ) -> Result<SourceBatch, SourceError> {
        let shared = self.shared.lock();
        if shared.closed {
            return Err(SourceError::Closed);
        }
        shared.table.read_after(last_offset, max_records)
    }

    async fn commit(&mut self, offset: Offset) -> Result<(), SourceError> {
        self.shared.lock().table.truncate_through(offset);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.shared.lock().closed = true;
        Ok(())
    }
}
