//! Configuration for streaming queries.

use std::time::Duration;

use rill_storage::DurableStoreConfig;

use crate::retry::RetryPolicy;

/// Where aggregate state lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateBackendConfig {
    /// In-process only; state is lost on restart.
    #[default]
    Memory,
    /// In-memory map with a write-ahead log and periodic checkpoints.
    Durable(DurableStoreConfig),
}

/// What the scheduler does when a batch could not take all available input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BacklogPolicy {
    /// Wait for the next tick.
    #[default]
    SkipTick,
    /// Run the next batch immediately while batches come back full.
    CatchUp,
}

/// Configuration for a streaming query.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Query name used in logs and progress reports.
    pub name: String,
    /// Upper bound on records polled per batch.
    pub max_records_per_batch: usize,
    /// Pause after an empty poll when batches run back to back.
    pub idle_poll_interval: Duration,
    /// Stop after running this long (`None` = until stopped).
    pub run_for: Option<Duration>,
    /// Behaviour when input is left over after a batch.
    pub backlog: BacklogPolicy,
    /// State store backing.
    pub state: StateBackendConfig,
    /// Retries for transient source failures within one batch.
    pub source_retry: RetryPolicy,
    /// Retries for transient sink failures within one batch.
    pub sink_retry: RetryPolicy,
    /// Re-runs of a failed batch before the query stops.
    pub restart: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "query".to_string(),
            max_records_per_batch: 10_000,
            idle_poll_interval: Duration::from_millis(10),
            run_for: None,
            backlog: BacklogPolicy::SkipTick,
            state: StateBackendConfig::Memory,
            source_retry: RetryPolicy::default(),
            sink_retry: RetryPolicy::default(),
            restart: RetryPolicy::none(),
        }
    }
}

impl EngineConfig {
    /// Default configuration with the given query name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the per-batch record limit.
    #[must_use]
    pub fn with_max_records_per_batch(mut self, max: usize) -> Self {
        self.max_records_per_batch = max;
        self
    }

    /// Sets the pause after an empty poll for zero-interval triggers.
    #[must_use]
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Stops the query after `duration`.
    #[must_use]
    pub fn with_run_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    /// Sets the backlog policy.
    #[must_use]
    pub fn with_backlog(mut self, backlog: BacklogPolicy) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the state backend.
    #[must_use]
    pub fn with_state(mut self, state: StateBackendConfig) -> Self {
        self.state = state;
        self
    }

    /// Sets the source retry policy.
    #[must_use]
    pub fn with_source_retry(mut self, policy: RetryPolicy) -> Self {
        self.source_retry = policy;
        self
    }

    /// Sets the sink retry policy.
    #[must_use]
    pub fn with_sink_retry(mut self, policy: RetryPolicy) -> Self {
        self.sink_retry = policy;
        self
    }

    /// Sets the batch restart policy.
    #[must_use]
    pub fn with_restart(mut self, policy: RetryPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_records_per_batch == 0 {
            return Err("max_records_per_batch must be at least 1".to_string());
        }
        if self.name.is_empty() {
            return Err("query name must not be empty".to_string());
        }
        Ok(())
    }
}
