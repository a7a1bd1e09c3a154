//! Running an engine under a trigger on a background task.
//!
//! [`StreamingQuery::start`] moves the engine onto a tokio task and returns
//! a [`QueryHandle`]. The handle talks to the task through three channels:
//! a shutdown signal, a manual-trigger notifier and a progress watch.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::BacklogPolicy;
use crate::engine::MicroBatchEngine;
use crate::error::EngineError;
use crate::progress::{QueryProgress, QuerySummary, StopReason};
use crate::trigger::{Fire, ShutdownSignal, Trigger, TriggerScheduler};

/// Entry point for running a [`MicroBatchEngine`] continuously.
#[derive(Debug)]
pub struct StreamingQuery;

impl StreamingQuery {
    /// Spawns the query on the current tokio runtime.
    ///
    /// Dropping the returned handle stops the query.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn start(engine: MicroBatchEngine, trigger: Trigger) -> QueryHandle {
        let name = engine.config().name.clone();
        let shutdown = ShutdownSignal::new();
        let manual = Arc::new(Notify::new());
        let (progress_tx, progress_rx) = watch::channel(None);

        let scheduler = TriggerScheduler::new(
            trigger,
            Arc::clone(&manual),
            shutdown.listener(),
            engine.config().run_for,
        );
        let task = tokio::spawn(run_query(engine, trigger, scheduler, progress_tx));

        QueryHandle {
            name,
            shutdown,
            manual,
            progress: progress_rx,
            task: Some(task),
        }
    }
}

/// Controls a running query.
#[derive(Debug)]
pub struct QueryHandle {
    name: String,
    shutdown: ShutdownSignal,
    manual: Arc<Notify>,
    progress: watch::Receiver<Option<QueryProgress>>,
    task: Option<JoinHandle<Result<QuerySummary, EngineError>>>,
}

impl QueryHandle {
    /// Query name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the query to stop. A batch whose records were already polled
    /// finishes first.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// A signal that stops the query, for use from other tasks.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Runs a batch now instead of waiting for the next tick.
    pub fn trigger_now(&self) {
        self.manual.notify_one();
    }

    /// Whether the query task is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Progress of the most recent committed batch.
    #[must_use]
    pub fn last_progress(&self) -> Option<QueryProgress> {
        self.progress.borrow().clone()
    }

    /// A receiver that observes every progress update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<QueryProgress>> {
        self.progress.clone()
    }

    /// Waits until batch `batch_id` (or a later one) has committed.
    ///
    /// Returns `None` if the query ends first.
    pub async fn await_batch(&self, batch_id: u64) -> Option<QueryProgress> {
        let mut rx = self.progress.clone();
        let reached = rx
            .wait_for(|p| p.as_ref().is_some_and(|p| p.batch_id >= batch_id))
            .await
            .ok()?;
        reached.clone()
    }

    /// Waits for the query to end.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the query, or [`EngineError::Task`]
    /// if the task panicked or was already awaited.
    pub async fn await_termination(mut self) -> Result<QuerySummary, EngineError> {
        let task = self
            .task
            .take()
            .ok_or_else(|| EngineError::Task("query already awaited".to_string()))?;
        match task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Task(e.to_string())),
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.trigger();
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    batches: u64,
    input_rows: u64,
    restarts: usize,
}

async fn run_query(
    mut engine: MicroBatchEngine,
    trigger: Trigger,
    mut scheduler: TriggerScheduler,
    progress: watch::Sender<Option<QueryProgress>>,
) -> Result<QuerySummary, EngineError> {
    let name = engine.config().name.clone();
    info!(query = %name, ?trigger, offset = engine.committed_offset(), "query started");

    let mut totals = Totals::default();
    let outcome = drive(&mut engine, trigger, &mut scheduler, &progress, &mut totals).await;
    let closed = engine.close().await;

    let reason = match outcome {
        Ok(reason) => reason,
        Err(e) => {
            error!(query = %name, error = %e, "query failed");
            return Err(e);
        }
    };
    closed?;

    info!(
        query = %name,
        ?reason,
        batches = totals.batches,
        restarts = totals.restarts,
        "query stopped"
    );
    Ok(QuerySummary {
        query: name,
        reason,
        batches: totals.batches,
        input_rows: totals.input_rows,
        last_batch_id: engine.committed().batch_id,
        end_offset: engine.committed_offset(),
        restarts: totals.restarts,
    })
}

async fn drive(
    engine: &mut MicroBatchEngine,
    trigger: Trigger,
    scheduler: &mut TriggerScheduler,
    progress: &watch::Sender<Option<QueryProgress>>,
    totals: &mut Totals,
) -> Result<StopReason, EngineError> {
    let max_records = engine.config().max_records_per_batch;
    let backlog = engine.config().backlog;
    let restart = engine.config().restart;
    let idle = engine.config().idle_poll_interval;
    let back_to_back = matches!(trigger, Trigger::ProcessingTime(interval) if interval.is_zero());
    let mut failures = 0;

    loop {
        match scheduler.next().await {
            Fire::Shutdown => return Ok(StopReason::Stopped),
            Fire::Deadline => return Ok(StopReason::Deadline),
            Fire::Tick | Fire::Manual => {}
        }

        // Catch-up and drain runs poll again without waiting for the scheduler
        loop {
            if scheduler.deadline_passed() {
                return Ok(StopReason::Deadline);
            }
            let polled = tokio::select! {
                biased;
                () = scheduler.shutdown().wait() => return Ok(StopReason::Stopped),
                polled = engine.poll() => polled,
            };
            let result = match polled {
                Ok(batch) if batch.is_empty() => Ok(None),
                Ok(batch) => engine.process(batch).await.map(Some),
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(report)) => {
                    failures = 0;
                    totals.batches += 1;
                    totals.input_rows += report.input_rows as u64;
                    let full = report.input_rows >= max_records;
                    progress.send_replace(Some(report));

                    match trigger {
                        Trigger::Once => return Ok(StopReason::Completed),
                        Trigger::AvailableNow => {}
                        Trigger::ProcessingTime(_) => {
                            if !(full && backlog == BacklogPolicy::CatchUp) {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    failures = 0;
                    if trigger.is_bounded() {
                        return Ok(StopReason::Completed);
                    }
                    if engine.source_exhausted() {
                        return Ok(StopReason::SourceExhausted);
                    }
                    if back_to_back {
                        scheduler.sleep(idle).await;
                    }
                    break;
                }
                Err(e) if e.is_restartable() && restart.allows_retry(failures) => {
                    failures += 1;
                    totals.restarts += 1;
                    let delay = restart.backoff.delay(failures);
                    warn!(
                        query = %engine.config().name,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "batch failed, restarting"
                    );
                    if !scheduler.sleep(delay).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
