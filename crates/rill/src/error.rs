//! Error types for the engine.

use rill_core::pipeline::{ExecError, PlanError};
use rill_core::schema::SchemaError;
use rill_core::sink::SinkError;
use rill_core::source::SourceError;
use rill_core::state::StateError;
use rill_core::Offset;
use rill_storage::StorageError;

/// Errors from running a streaming query.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid engine or query configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipeline construction error
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Source failure
    #[error("source '{source_name}': {error}")]
    Source {
        /// Source name.
        source_name: String,
        /// Underlying error.
        #[source]
        error: SourceError,
    },

    /// A polled record does not match the source schema
    #[error("schema mismatch at offset {offset}: {error}")]
    SchemaMismatch {
        /// Offset of the offending record.
        offset: Offset,
        /// What did not match.
        #[source]
        error: SchemaError,
    },

    /// The source returned a batch whose offsets do not continue the log
    #[error("offset gap: expected batch ending at {expected}, source reported {actual}")]
    OffsetGap {
        /// End offset implied by the committed offset and the record count.
        expected: Offset,
        /// End offset the source reported.
        actual: Offset,
    },

    /// Evaluating the pipeline failed
    #[error("execution error: {0}")]
    Exec(#[from] ExecError),

    /// Sink failure
    #[error("sink '{sink}' failed for output '{output}': {error}")]
    Sink {
        /// Sink name.
        sink: String,
        /// Output being emitted.
        output: String,
        /// Underlying error.
        #[source]
        error: SinkError,
    },

    /// State store failure
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Durable storage failure while opening the state backend
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The query task ended abnormally
    #[error("query task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Whether a source error is worth polling again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Source { error, .. } => error.is_transient(),
            EngineError::Sink { error, .. } => error.is_transient(),
            _ => false,
        }
    }

    /// Whether the restart policy may re-run the failed batch.
    ///
    /// Configuration, plan, offset-gap and corruption errors never get
    /// better by running again.
    #[must_use]
    pub fn is_restartable(&self) -> bool {
        match self {
            EngineError::Config(_)
            | EngineError::Plan(_)
            | EngineError::OffsetGap { .. }
            | EngineError::Storage(_)
            | EngineError::Task(_)
            | EngineError::State(StateError::Corruption(_)) => false,
            EngineError::Source { error, .. } => {
                !matches!(error, SourceError::Closed | SourceError::OffsetOutOfRange { .. })
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let unavailable = EngineError::Source {
            source_name: "s".into(),
            error: SourceError::Unavailable("down".into()),
        };
        assert!(unavailable.is_transient());
        assert!(unavailable.is_restartable());

        let gap = EngineError::OffsetGap {
            expected: 3,
            actual: 5,
        };
        assert!(!gap.is_transient());
        assert!(!gap.is_restartable());

        let corrupt = EngineError::State(StateError::Corruption("bad crc".into()));
        assert!(!corrupt.is_restartable());

        let mismatch = EngineError::SchemaMismatch {
            offset: 1,
            error: SchemaError::FieldCount {
                expected: 1,
                actual: 2,
            },
        };
        assert!(mismatch.is_restartable());
        assert!(!mismatch.is_transient());
    }
}
