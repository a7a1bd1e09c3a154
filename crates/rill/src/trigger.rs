//! Triggers decide when micro-batches run.
//!
//! The scheduler is the only task waiting on timers. It wakes for the next
//! interval tick, a manual trigger, the run deadline, or shutdown, and the
//! engine runs a batch for ticks and manual triggers. Ticks missed while a
//! batch was running are skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// When a query runs batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A batch every interval; a zero interval runs batches back to back.
    ProcessingTime(Duration),
    /// One batch, then stop.
    Once,
    /// Batches until the source has no more data, then stop.
    AvailableNow,
}

impl Trigger {
    /// A batch every `interval`.
    #[must_use]
    pub fn processing_time(interval: Duration) -> Self {
        Trigger::ProcessingTime(interval)
    }

    /// Batches back to back, as fast as input allows.
    #[must_use]
    pub fn continuous() -> Self {
        Trigger::ProcessingTime(Duration::ZERO)
    }

    /// Whether the query ends by itself.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        matches!(self, Trigger::Once | Trigger::AvailableNow)
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::continuous()
    }
}

/// Asks a running query to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Triggers shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A listener for this signal.
    #[must_use]
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    /// Whether shutdown was triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered. Never resolves if every signal
    /// was dropped untriggered.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Why the scheduler woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fire {
    /// Interval tick (or immediate for bounded triggers).
    Tick,
    /// `trigger_now` was called.
    Manual,
    /// Stop requested.
    Shutdown,
    /// `run_for` elapsed.
    Deadline,
}

/// Waits for the next reason to run a batch.
#[derive(Debug)]
pub(crate) struct TriggerScheduler {
    interval: Option<Interval>,
    manual: Arc<Notify>,
    shutdown: ShutdownListener,
    deadline: Option<Instant>,
}

impl TriggerScheduler {
    pub(crate) fn new(
        trigger: Trigger,
        manual: Arc<Notify>,
        shutdown: ShutdownListener,
        run_for: Option<Duration>,
    ) -> Self {
        let interval = match trigger {
            Trigger::ProcessingTime(period) if !period.is_zero() => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Some(interval)
            }
            _ => None,
        };
        Self {
            interval,
            manual,
            shutdown,
            deadline: run_for.map(|d| Instant::now() + d),
        }
    }

    pub(crate) async fn next(&mut self) -> Fire {
        if self.shutdown.is_triggered() {
            return Fire::Shutdown;
        }
        if self.deadline_passed() {
            return Fire::Deadline;
        }

        let Self {
            interval,
            manual,
            shutdown,
            deadline,
        } = self;
        let deadline = *deadline;

        tokio::select! {
            biased;
            () = shutdown.wait() => Fire::Shutdown,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => Fire::Deadline,
            () = manual.notified() => Fire::Manual,
            () = async {
                if let Some(interval) = interval {
                    interval.tick().await;
                }
            } => Fire::Tick,
        }
    }

    /// Waits `delay` unless shutdown or the deadline comes first. Returns
    /// `false` if the wait was cut short.
    pub(crate) async fn sleep(&mut self, delay: Duration) -> bool {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            () = self.shutdown.wait() => false,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Whether `run_for` has elapsed.
    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    pub(crate) fn shutdown(&mut self) -> &mut ShutdownListener {
        &mut self.shutdown
    }
}
