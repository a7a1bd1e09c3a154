//! Per-batch progress reports and the end-of-run summary.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rill_core::Offset;

/// What one committed batch did.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueryProgress {
    /// Query name.
    pub query: String,
    /// Id of the committed batch.
    pub batch_id: u64,
    /// Offset committed before the batch.
    pub start_offset: Offset,
    /// Offset committed by the batch.
    pub end_offset: Offset,
    /// Records read from the source.
    pub input_rows: usize,
    /// Rows emitted per output.
    pub output_rows: BTreeMap<String, usize>,
    /// Rows dropped because their window had already closed.
    pub late_rows: u64,
    /// Pipeline stages evaluated (shared stages count once).
    pub stages_evaluated: usize,
    /// State entries after the commit.
    pub state_entries: usize,
    /// Approximate state size after the commit.
    pub state_bytes: usize,
    /// Watermark per windowed output, millis.
    pub watermarks: BTreeMap<String, i64>,
    /// Wall time spent on the batch.
    pub duration_ms: u64,
    /// Commit time (millis since Unix epoch).
    pub timestamp_ms: u64,
}

impl QueryProgress {
    /// Total rows emitted across outputs.
    #[must_use]
    pub fn total_output_rows(&self) -> usize {
        self.output_rows.values().sum()
    }

    /// Serializes the report as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serializes the report as indented JSON.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Why a query stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called or every handle was dropped.
    Stopped,
    /// `run_for` elapsed.
    Deadline,
    /// A `Once` or `AvailableNow` trigger finished its work.
    Completed,
    /// The source reported it will produce nothing more.
    SourceExhausted,
}

/// Totals for a finished query.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuerySummary {
    /// Query name.
    pub query: String,
    /// Why the query stopped.
    pub reason: StopReason,
    /// Batches committed during this run.
    pub batches: u64,
    /// Source records processed during this run.
    pub input_rows: u64,
    /// Id of the last committed batch, including earlier runs.
    pub last_batch_id: u64,
    /// Offset committed when the query stopped.
    pub end_offset: Offset,
    /// Failed batches re-run under the restart policy.
    pub restarts: usize,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
