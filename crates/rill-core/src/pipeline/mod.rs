//! # Pipeline Module
//!
//! Declarative query pipelines and their per-batch executor.
//!
//! A [`PipelineBuilder`] assembles an immutable graph of stages rooted at the
//! source: stateless transforms ([`project`](PipelineBuilder::project),
//! [`filter`](PipelineBuilder::filter), [`explode`](PipelineBuilder::explode),
//! [`join_static`](PipelineBuilder::join_static)) followed by named outputs,
//! each of which may carry one aggregation. Column names are resolved while
//! building; execution only touches indices.
//!
//! Structurally equal stages (same input, same operation) are created once,
//! so outputs that share a prefix share its stage ids and the executor
//! evaluates that prefix once per batch.
//!
//! ## Aggregation state layout
//!
//! Aggregate state lives in the [`StateStore`](crate::state::StateStore)
//! under `output index (u16, big endian) ++ rkyv(GroupKey)`. The executor
//! never writes to the store: it returns the batch's deltas as a
//! [`WriteBatch`](crate::state::WriteBatch) for the engine to commit.

mod builder;
mod executor;
mod expr;
mod join;

pub use builder::{
    avg, count, count_col, first, last, max, min, sum, AggregateExpr, AggregateSpec, Delimiter,
    Output, Pipeline, PipelineBuilder, StageId, Window,
};
pub use executor::{BatchInput, BatchResult, GroupKey, OutputRows};
pub use expr::{col, lit, BinaryOp, Expr, PhysicalExpr, StringFunc};
pub use join::{JoinType, StaticTable, StaticTableHandle};

use crate::schema::SchemaError;
use crate::state::StateError;

/// Execution tuning passed explicitly to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Worker threads used to fold aggregation input (1 = no threads).
    pub parallelism: usize,
    /// Minimum rows in a batch before aggregation is parallelised.
    pub parallel_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            parallel_threshold: 4096,
        }
    }
}

impl PipelineConfig {
    /// Sets the number of aggregation workers.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the row count at which aggregation is parallelised.
    #[must_use]
    pub fn with_parallel_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold = rows;
        self
    }
}

/// Errors raised while building a pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// Unknown column or schema conversion failure
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Ill-typed expression or operation
    #[error("type error in {expr}: {message}")]
    Type {
        /// Offending expression or operation.
        expr: String,
        /// What is wrong with it.
        message: String,
    },

    /// A stage would produce two fields with the same name
    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    /// Two outputs share a name
    #[error("duplicate output '{0}'")]
    DuplicateOutput(String),

    /// Stage id not produced by this builder
    #[error("unknown stage {0}")]
    UnknownStage(usize),

    /// Output definition violates its mode's requirements
    #[error("invalid output '{output}': {message}")]
    InvalidOutput {
        /// Output name.
        output: String,
        /// Reason.
        message: String,
    },

    /// Static table definition or reload error
    #[error("static table: {0}")]
    StaticTable(String),

    /// Nothing to run
    #[error("pipeline has no outputs")]
    NoOutputs,
}

/// Errors raised while executing a batch.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Integer overflow in an expression
    #[error("integer overflow evaluating {0}")]
    Overflow(String),

    /// Reading or encoding aggregate state failed
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// An aggregation worker thread panicked
    #[error("aggregation worker panicked")]
    WorkerPanicked,
}
