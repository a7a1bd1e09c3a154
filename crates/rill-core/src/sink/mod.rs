//! # Output Sinks
//!
//! Sinks receive each output's rows once per micro-batch.
//!
//! The engine emits every output of a batch before it commits the batch's
//! state and offset. A batch that fails after some outputs were emitted is
//! re-run from the same offset, so sinks see at-least-once delivery and may
//! receive the same `batch_id` twice. Sinks that need exactly-once delivery
//! can deduplicate on `(batch_id, output)`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::record::{records_to_arrow, Record};
use crate::schema::{SchemaError, SchemaRef};

mod console;
mod memory;

pub use console::ConsoleSink;
pub use memory::{MemorySink, MemorySinkHandle};

/// Which rows an output emits each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputMode {
    /// The full result table, every batch. Requires an aggregation.
    Complete,
    /// Only rows that will never change again, each exactly once.
    Append,
    /// Only rows whose value changed in this batch.
    Update,
}

impl OutputMode {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Complete => "complete",
            OutputMode::Append => "append",
            OutputMode::Update => "update",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "complete" => Ok(OutputMode::Complete),
            "append" => Ok(OutputMode::Append),
            "update" => Ok(OutputMode::Update),
            other => Err(format!("unknown output mode '{other}'")),
        }
    }
}

/// Rows of one output for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitBatch {
    /// Batch that produced the rows.
    pub batch_id: u64,
    /// Output name.
    pub output: String,
    /// Output mode the rows follow.
    pub mode: OutputMode,
    /// Row schema.
    pub schema: SchemaRef,
    /// Rows, ordered by group key for aggregated outputs.
    pub rows: Vec<Record>,
}

impl EmitBatch {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Converts the rows to an Arrow `RecordBatch`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if a row does not match the schema.
    pub fn to_record_batch(&self) -> Result<arrow_array::RecordBatch, SchemaError> {
        records_to_arrow(&self.schema, &self.rows)
    }
}

/// Destination for output rows.
#[async_trait]
pub trait OutputSink: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Delivers one output's rows for a batch.
    ///
    /// Called for every output each batch, even when there are no rows.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if the rows could not be delivered. The engine
    /// retries transient errors and otherwise aborts the batch.
    async fn emit(&mut self, batch: &EmitBatch) -> Result<(), SinkError>;

    /// Flushes and releases resources.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if the final flush fails.
    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Errors raised by sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Transient failure; emitting again may succeed
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rows could not be converted for the destination
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Sink was closed
    #[error("sink closed")]
    Closed,
}

impl SinkError {
    /// Whether emitting again may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Io(_))
    }
}
