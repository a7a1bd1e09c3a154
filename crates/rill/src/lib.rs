//! # Rill
//!
//! A single-process micro-batch streaming engine.
//!
//! A query reads an unbounded source in batches, evaluates an incremental
//! [`Pipeline`](rill_core::pipeline::Pipeline) against keyed aggregate state,
//! emits each output to a sink in its output mode, and commits state and
//! source offset together. Triggers decide when batches run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rill::{EngineConfig, MicroBatchEngine, StreamingQuery, Trigger};
//! use rill_core::pipeline::{col, count, AggregateSpec, Delimiter, PipelineBuilder};
//! use rill_core::sink::{ConsoleSink, OutputMode};
//! use rill_core::source::ChannelSource;
//!
//! # async fn run() -> Result<(), rill::EngineError> {
//! let (source, lines) = ChannelSource::lines(1024);
//! let mut builder = PipelineBuilder::new(lines.schema().clone());
//! let words = builder.explode(builder.source(), "value", Delimiter::Whitespace)?;
//! let words = builder.project(words, vec![("word", col("value").lower())])?;
//! builder.aggregate(
//!     "word_counts",
//!     words,
//!     AggregateSpec::new().group_by("word").aggregate(count().alias("count")),
//!     OutputMode::Complete,
//! )?;
//!
//! let engine = MicroBatchEngine::builder(builder.build()?, source)
//!     .config(EngineConfig::new("word_count"))
//!     .default_sink(ConsoleSink::stdout())
//!     .build()?;
//! let query = StreamingQuery::start(engine, Trigger::processing_time(Duration::from_secs(1)));
//! let _reader = lines.spawn_line_reader(tokio::io::BufReader::new(tokio::io::stdin()));
//! drop(lines);
//! tokio::time::sleep(Duration::from_secs(10)).await;
//! query.stop();
//! query.await_termination().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod progress;
pub mod query;
pub mod retry;
pub mod telemetry;
pub mod trigger;

pub use config::{BacklogPolicy, EngineConfig, StateBackendConfig};
pub use engine::{EngineBuilder, MicroBatchEngine};
pub use error::EngineError;
pub use progress::{QueryProgress, QuerySummary, StopReason};
pub use query::{QueryHandle, StreamingQuery};
pub use retry::{Backoff, RetryPolicy};
pub use trigger::{ShutdownSignal, Trigger};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
