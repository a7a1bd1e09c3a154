//! The micro-batch engine.
//!
//! One batch runs at a time:
//!
//! 1. poll the source after the committed offset (transient failures are
//!    retried with the source retry policy)
//! 2. check the batch continues the log and matches the source schema
//! 3. evaluate the pipeline against the current state
//! 4. emit every output to its sink (retried with the sink retry policy)
//! 5. commit the state deltas together with the new offset and watermarks
//! 6. let the source truncate what can no longer be replayed
//!
//! A failure before step 5 leaves state and offset untouched, so running the
//! batch again applies it exactly once. Sinks may see a batch twice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rill_core::pipeline::{BatchInput, BatchResult, OutputRows, Pipeline};
use rill_core::sink::{EmitBatch, OutputSink, SinkError};
use rill_core::source::{SourceAdapter, SourceBatch, SourceError};
use rill_core::state::{CommitMarker, InMemoryStore, StateStore};
use rill_core::Offset;
use rill_storage::DurableStateStore;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StateBackendConfig};
use crate::error::EngineError;
use crate::progress::{now_millis, QueryProgress};
use crate::retry::with_retry;

/// Assembles a [`MicroBatchEngine`].
pub struct EngineBuilder {
    pipeline: Pipeline,
    source: Box<dyn SourceAdapter>,
    config: EngineConfig,
    sinks: Vec<Box<dyn OutputSink>>,
    routes: Vec<(String, usize)>,
    default_sink: Option<usize>,
}

impl EngineBuilder {
    /// Sets the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sends the rows of `output` to `sink`.
    #[must_use]
    pub fn sink(mut self, output: &str, sink: impl OutputSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self.routes.push((output.to_string(), self.sinks.len() - 1));
        self
    }

    /// Sends every output without its own sink to `sink`.
    #[must_use]
    pub fn default_sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self.default_sink = Some(self.sinks.len() - 1);
        self
    }

    /// Validates the wiring and opens the state backend.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is invalid, the
    /// source schema differs from the pipeline input, or an output has no
    /// sink, and [`EngineError::Storage`] if durable state cannot be
    /// recovered.
    pub fn build(self) -> Result<MicroBatchEngine, EngineError> {
        let Self {
            pipeline,
            source,
            config,
            sinks,
            routes,
            default_sink,
        } = self;

        config.validate().map_err(EngineError::Config)?;

        if source.schema().as_ref() != pipeline.source_schema().as_ref() {
            return Err(EngineError::Config(format!(
                "schema of source '{}' does not match the pipeline input",
                source.name()
            )));
        }

        if let Some((name, _)) = routes
            .iter()
            .find(|(name, _)| pipeline.output(name).is_none())
        {
            return Err(EngineError::Config(format!(
                "sink registered for unknown output '{name}'"
            )));
        }

        let mut output_routes = Vec::with_capacity(pipeline.outputs().len());
        for output in pipeline.outputs() {
            let route = routes
                .iter()
                .rev()
                .find(|(name, _)| name == output.name())
                .map(|(_, idx)| *idx)
                .or(default_sink)
                .ok_or_else(|| {
                    EngineError::Config(format!("no sink for output '{}'", output.name()))
                })?;
            output_routes.push(route);
        }

        let (store, durable) = match &config.state {
            StateBackendConfig::Memory => {
                let store: Box<dyn StateStore> = Box::new(InMemoryStore::new());
                (store, false)
            }
            StateBackendConfig::Durable(store_config) => {
                let store = DurableStateStore::open(store_config.clone())?;
                let recovery = store.recovery();
                info!(
                    query = %config.name,
                    checkpoint_id = ?recovery.checkpoint_id,
                    replayed_batches = recovery.replayed_batches,
                    "state recovered"
                );
                let store: Box<dyn StateStore> = Box::new(store);
                (store, true)
            }
        };

        let committed = store.last_commit().cloned().unwrap_or_default();
        info!(
            query = %config.name,
            source = source.name(),
            outputs = pipeline.outputs().len(),
            batch_id = committed.batch_id,
            offset = committed.end_offset,
            "engine ready"
        );

        Ok(MicroBatchEngine {
            config,
            pipeline,
            source,
            sinks,
            routes: output_routes,
            store,
            durable,
            committed,
        })
    }
}

/// Runs micro-batches of one pipeline from one source into its sinks.
///
/// The engine is driven either batch by batch with
/// [`run_once`](Self::run_once) or by a [`StreamingQuery`](crate::StreamingQuery)
/// that owns it on a tokio task.
pub struct MicroBatchEngine {
    config: EngineConfig,
    pipeline: Pipeline,
    source: Box<dyn SourceAdapter>,
    sinks: Vec<Box<dyn OutputSink>>,
    /// Sink index per pipeline output.
    routes: Vec<usize>,
    store: Box<dyn StateStore>,
    durable: bool,
    committed: CommitMarker,
}

impl std::fmt::Debug for MicroBatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroBatchEngine")
            .field("query", &self.config.name)
            .field("source", &self.source.name())
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("committed", &self.committed)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl MicroBatchEngine {
    /// Starts building an engine for `pipeline` reading from `source`.
    #[must_use]
    pub fn builder(pipeline: Pipeline, source: impl SourceAdapter + 'static) -> EngineBuilder {
        EngineBuilder {
            pipeline,
            source: Box::new(source),
            config: EngineConfig::default(),
            sinks: Vec::new(),
            routes: Vec::new(),
            default_sink: None,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The pipeline being run.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Current aggregate state.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Marker of the last committed batch (zeroed before the first).
    #[must_use]
    pub fn committed(&self) -> &CommitMarker {
        &self.committed
    }

    /// Offset the next batch reads after.
    #[must_use]
    pub fn committed_offset(&self) -> Offset {
        self.committed.end_offset
    }

    /// Whether the source reports it will produce nothing more.
    #[must_use]
    pub fn source_exhausted(&self) -> bool {
        self.source.is_exhausted()
    }

    /// Polls and processes one batch. Returns `None` without running a
    /// batch when the source has nothing new.
    ///
    /// # Errors
    ///
    /// Returns the first error of the batch; nothing is committed then.
    pub async fn run_once(&mut self) -> Result<Option<QueryProgress>, EngineError> {
        let batch = self.poll().await?;
        if batch.is_empty() {
            return Ok(None);
        }
        self.process(batch).await.map(Some)
    }

    /// Polls the source after the committed offset, retrying transient
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] once the source retry policy gives up
    /// or the failure is not transient.
    pub async fn poll(&mut self) -> Result<SourceBatch, EngineError> {
        let last = self.committed.end_offset;
        let max = self.config.max_records_per_batch;
        let query = &self.config.name;
        let source_name = self.source.name().to_string();

        with_retry(
            &self.config.source_retry,
            self.source.as_mut(),
            |source| source.poll(last, max),
            SourceError::is_transient,
            |attempt, e| {
                warn!(query = %query, source = %source_name, attempt, error = %e, "poll failed");
            },
        )
        .await
        .map_err(|error| EngineError::Source {
            source_name: source_name.clone(),
            error,
        })
    }

    /// Processes a batch returned by [`poll`](Self::poll) and commits it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OffsetGap`] if the batch does not continue
    /// the committed offset, [`EngineError::SchemaMismatch`] for a record
    /// that does not match the source schema, and execution, sink or state
    /// errors. State and offset are unchanged on error.
    pub async fn process(&mut self, batch: SourceBatch) -> Result<QueryProgress, EngineError> {
        let started = Instant::now();
        let start_offset = self.committed.end_offset;
        let batch_id = self.committed.batch_id + 1;

        let expected = start_offset + batch.len() as u64;
        if batch.end_offset != expected {
            return Err(EngineError::OffsetGap {
                expected,
                actual: batch.end_offset,
            });
        }

        let schema = self.pipeline.source_schema();
        for (record, offset) in batch.records.iter().zip(start_offset + 1..) {
            schema
                .validate(record)
                .map_err(|error| EngineError::SchemaMismatch { offset, error })?;
        }

        let BatchResult {
            outputs,
            mut writes,
            watermarks,
            stages_evaluated,
            late_rows,
        } = self.pipeline.execute(
            &BatchInput {
                batch_id,
                start_offset,
                records: &batch.records,
                watermarks: &self.committed.watermarks,
            },
            self.store.as_ref(),
        )?;

        let mut output_rows = BTreeMap::new();
        for (idx, rows) in outputs.into_iter().enumerate() {
            let name = rows.name.clone();
            let count = rows.rows.len();
            let route = self.routes[idx];
            self.emit(route, batch_id, rows).await?;
            output_rows.insert(name, count);
        }

        let marker =
            CommitMarker::new(batch_id, batch.end_offset).with_watermarks(watermarks.clone());
        writes.commit(marker.clone());
        let state_writes = writes.len();
        self.store.write_batch(writes)?;
        self.committed = marker;

        let truncate_through = if self.durable {
            self.store.durable_commit().map_or(0, |c| c.end_offset)
        } else {
            self.committed.end_offset
        };
        if truncate_through > 0 {
            if let Err(e) = self.source.commit(truncate_through).await {
                warn!(
                    query = %self.config.name,
                    offset = truncate_through,
                    error = %e,
                    "source commit failed"
                );
            }
        }

        let progress = QueryProgress {
            query: self.config.name.clone(),
            batch_id,
            start_offset,
            end_offset: batch.end_offset,
            input_rows: batch.len(),
            output_rows,
            late_rows,
            stages_evaluated,
            state_entries: self.store.len(),
            state_bytes: self.store.size_bytes(),
            watermarks: watermarks.into_iter().collect(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp_ms: now_millis(),
        };
        debug!(
            query = %progress.query,
            batch_id,
            offset = batch.end_offset,
            rows = progress.input_rows,
            state_writes,
            duration_ms = progress.duration_ms,
            "batch committed"
        );
        Ok(progress)
    }

    async fn emit(
        &mut self,
        route: usize,
        batch_id: u64,
        rows: OutputRows,
    ) -> Result<(), EngineError> {
        let batch = Arc::new(EmitBatch {
            batch_id,
            output: rows.name,
            mode: rows.mode,
            schema: rows.schema,
            rows: rows.rows,
        });
        let query = &self.config.name;
        let sink = &mut self.sinks[route];
        let sink_name = sink.name().to_string();

        with_retry(
            &self.config.sink_retry,
            sink.as_mut(),
            |sink| {
                let batch = Arc::clone(&batch);
                Box::pin(async move { sink.emit(&batch).await })
            },
            SinkError::is_transient,
            |attempt, e| {
                warn!(
                    query = %query,
                    sink = %sink_name,
                    output = %batch.output,
                    batch_id,
                    attempt,
                    error = %e,
                    "emit failed"
                );
            },
        )
        .await
        .map_err(|error| EngineError::Sink {
            sink: sink_name.clone(),
            output: batch.output.clone(),
            error,
        })
    }

    /// Flushes state and closes the source and sinks.
    ///
    /// Every step is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first state, source or sink error hit while closing.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;

        if let Err(e) = self.store.flush() {
            warn!(query = %self.config.name, error = %e, "state flush failed");
            first_error.get_or_insert(EngineError::State(e));
        }
        if let Err(error) = self.source.close().await {
            warn!(query = %self.config.name, error = %error, "source close failed");
            first_error.get_or_insert(EngineError::Source {
                source_name: self.source.name().to_string(),
                error,
            });
        }
        for sink in &mut self.sinks {
            if let Err(error) = sink.close().await {
                warn!(query = %self.config.name, sink = sink.name(), error = %error, "sink close failed");
                first_error.get_or_insert(EngineError::Sink {
                    sink: sink.name().to_string(),
                    output: String::new(),
                    error,
                });
            }
        }

        info!(
            query = %self.config.name,
            batch_id = self.committed.batch_id,
            offset = self.committed.end_offset,
            "engine closed"
        );
        first_error.map_or(Ok(()), Err)
    }
}
