//! Sink that keeps every emitted batch in memory.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EmitBatch, OutputSink, SinkError};
use crate::record::Record;

#[derive(Debug, Default)]
struct Shared {
    emitted: Mutex<Vec<EmitBatch>>,
    fail_next: AtomicU32,
    closed: AtomicBool,
}

/// Sink storing emitted batches for inspection through a handle.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    shared: Arc<Shared>,
}

/// Reads what a [`MemorySink`] received. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemorySinkHandle {
    shared: Arc<Shared>,
}

impl MemorySink {
    /// Creates a sink and its handle.
    #[must_use]
    pub fn new() -> (Self, MemorySinkHandle) {
        let shared = Arc::new(Shared::default());
        let sink = Self {
            name: "memory".to_string(),
            shared: Arc::clone(&shared),
        };
        (sink, MemorySinkHandle { shared })
    }

    /// Sets the sink name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl MemorySinkHandle {
    /// All emitted batches in emission order.
    #[must_use]
    pub fn batches(&self) -> Vec<EmitBatch> {
        self.shared.emitted.lock().clone()
    }

    /// Emitted batches of one output.
    #[must_use]
    pub fn batches_for(&self, output: &str) -> Vec<EmitBatch> {
        self.shared
            .emitted
            .lock()
            .iter()
            .filter(|b| b.output == output)
            .cloned()
            .collect()
    }

    /// Most recent batch of one output.
    #[must_use]
    pub fn last(&self, output: &str) -> Option<EmitBatch> {
        self.shared
            .emitted
            .lock()
            .iter()
            .rev()
            .find(|b| b.output == output)
            .cloned()
    }

    /// Every row emitted for one output, concatenated.
    #[must_use]
    pub fn rows(&self, output: &str) -> Vec<Record> {
        self.shared
            .emitted
            .lock()
            .iter()
            .filter(|b| b.output == output)
            .flat_map(|b| b.rows.iter().cloned())
            .collect()
    }

    /// Makes the next `n` emits fail with [`SinkError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Forgets everything emitted so far.
    pub fn clear(&self) {
        self.shared.emitted.lock().clear();
    }

    /// Whether the engine closed the sink.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&mut self, batch: &EmitBatch) -> Result<(), SinkError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        let injected = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Unavailable(format!(
                "injected failure for batch {}",
                batch.batch_id
            )));
        }
        self.shared.emitted.lock().push(batch.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
