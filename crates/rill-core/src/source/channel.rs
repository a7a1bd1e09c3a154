//! Source fed by background producers over a bounded queue.
//!
//! Producers push records into a bounded `tokio::sync::mpsc` channel. Each
//! poll moves at most one batch worth of records into an append-only table,
//! which assigns offsets and keeps records until they are committed. The
//! rest stay queued, so a full queue pushes back on producers instead of
//! growing without bound.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{SourceAdapter, SourceBatch, SourceError};
use crate::record::{records_from_arrow, Offset, Record, Value};
use crate::schema::{DataType, Field, Schema, SchemaRef};
use crate::table::AppendOnlyTable;

/// Source draining a bounded channel into an offset-addressed table.
#[derive(Debug)]
pub struct ChannelSource {
    name: String,
    schema: SchemaRef,
    rx: mpsc::Receiver<Record>,
    table: AppendOnlyTable,
    disconnected: bool,
    closed: bool,
}

/// Producer side of a [`ChannelSource`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSourceHandle {
    schema: SchemaRef,
    tx: mpsc::Sender<Record>,
}

impl ChannelSource {
    /// Creates a source whose queue holds at most `capacity` records.
    #[must_use]
    pub fn new(schema: SchemaRef, capacity: usize) -> (Self, ChannelSourceHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            name: "channel".to_string(),
            schema: Arc::clone(&schema),
            rx,
            table: AppendOnlyTable::new(),
            disconnected: false,
            closed: false,
        };
        (source, ChannelSourceHandle { schema, tx })
    }

    /// Creates a source of text lines with a single non-null `value: Utf8`
    /// column.
    #[must_use]
    pub fn lines(capacity: usize) -> (Self, ChannelSourceHandle) {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "value",
            DataType::Utf8,
            false,
        )]));
        let (source, handle) = Self::new(schema, capacity);
        (source.with_name("lines"), handle)
    }

    /// Sets the source name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Moves queued records into the table until it holds `max_records`
    /// past `last_offset`.
    fn drain(&mut self, last_offset: Offset, max_records: usize) {
        let wanted = max_records as Offset;
        while self.table.latest_offset().saturating_sub(last_offset) < wanted {
            match self.rx.try_recv() {
                Ok(record) => {
                    self.table.append(record);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.disconnected {
                        tracing::debug!(source = %self.name, "all producers disconnected");
                    }
                    self.disconnected = true;
                    break;
                }
            }
        }
    }
}

impl ChannelSourceHandle {
    /// Enqueues a record, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source was dropped.
    pub async fn push(&self, record: Record) -> Result<(), SourceError> {
        self.tx.send(record).await.map_err(|_| SourceError::Closed)
    }

    /// Enqueues a record from a non-async thread, blocking while full.
    ///
    /// Must not be called from inside the async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source was dropped.
    pub fn push_blocking(&self, record: Record) -> Result<(), SourceError> {
        self.tx.blocking_send(record).map_err(|_| SourceError::Closed)
    }

    /// Enqueues every row of an Arrow batch.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Schema`] if the batch cannot be converted and
    /// [`SourceError::Closed`] if the source was dropped.
    pub async fn push_record_batch(
        &self,
        batch: &arrow_array::RecordBatch,
    ) -> Result<usize, SourceError> {
        let (_, records) = records_from_arrow(batch)?;
        let count = records.len();
        for record in records {
            self.push(record).await?;
        }
        Ok(count)
    }

    /// Declared schema of the source.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Spawns a task that pushes each line of `reader` as a one-column
    /// record, returning the number of lines read.
    ///
    /// The task ends at EOF or when the source goes away. Dropping the
    /// handle afterwards lets the source report exhaustion.
    pub fn spawn_line_reader<R>(&self, reader: R) -> JoinHandle<Result<u64, SourceError>>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut lines = reader.lines();
            let mut count = 0u64;
            while let Some(line) = lines.next_line().await? {
                handle.push(Record::new(vec![Value::Utf8(line)])).await?;
                count += 1;
            }
            tracing::debug!(lines = count, "line reader reached EOF");
            Ok(count)
        })
    }
}

#[async_trait]
impl SourceAdapter for ChannelSource {
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
        if self.closed {
            return Err(SourceError::Closed);
        }
        self.drain(last_offset, max_records);
        self.table.read_after(last_offset, max_records)
    }

    fn is_exhausted(&self) -> bool {
        self.disconnected
    }

    async fn commit(&mut self, offset: Offset) -> Result<(), SourceError> {
        self.table.truncate_through(offset);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.rx.close();
        self.closed = true;
        Ok(())
    }
}
