//! # Rill Core
//!
//! The single-process micro-batch streaming core used by the `rill` engine.
//!
//! This crate provides:
//! - **Schema / Record**: typed schema descriptors, values and immutable records
//! - **Append-only table**: offset-addressed record log backing the sources
//! - **State Store**: keyed aggregate state with deterministic snapshots
//! - **Pipeline**: immutable stage graph, expressions, static joins, aggregation
//! - **Source / Sink**: the poll-based source adapter and emit-based sink contracts
//!
//! ## Design Principles
//!
//! 1. **Resolve once** - column names are resolved to indices at build time
//! 2. **One batch in flight** - state is only mutated by the active batch
//! 3. **All-or-nothing commits** - state deltas and offsets land together
//! 4. **Deterministic snapshots** - state iterates in key order
//!
//! ## Example
//!
//! ```rust
//! use rill_core::pipeline::{col, count, AggregateSpec, PipelineBuilder, Delimiter};
//! use rill_core::schema::{DataType, Field, Schema};
//! use rill_core::sink::OutputMode;
//! use std::sync::Arc;
//!
//! let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]));
//! let mut builder = PipelineBuilder::new(schema);
//! let words = builder.explode(builder.source(), "value", Delimiter::Whitespace).unwrap();
//! let words = builder.project(words, vec![("word", col("value").lower())]).unwrap();
//! builder
//!     .aggregate(
//!         "word_counts",
//!         words,
//!         AggregateSpec::new().group_by("word").aggregate(count().alias("count")),
//!         OutputMode::Complete,
//!     )
//!     .unwrap();
//! let pipeline = builder.build().unwrap();
//! assert_eq!(pipeline.outputs().len(), 1);
//! ```

#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod sink;
pub mod source;
pub mod state;
pub mod table;

pub use record::{Offset, Record, Value};
pub use schema::{DataType, Field, Schema, SchemaRef};

/// Result type for rill-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rill-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Schema errors
    #[error("Schema error: {0}")]
    Schema(#[from] schema::SchemaError),

    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Pipeline construction errors
    #[error("Plan error: {0}")]
    Plan(#[from] pipeline::PlanError),

    /// Pipeline execution errors
    #[error("Execution error: {0}")]
    Exec(#[from] pipeline::ExecError),

    /// Source adapter errors
    #[error("Source error: {0}")]
    Source(#[from] source::SourceError),

    /// Output sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] sink::SinkError),
}
