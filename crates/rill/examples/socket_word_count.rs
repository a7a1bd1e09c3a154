//! Running word count over lines from a TCP socket or stdin.
//!
//! ```text
//! nc -lk 9999                                   # in one terminal
//! cargo run -p rill --example socket_word_count -- --connect 127.0.0.1:9999
//! ```
//!
//! Without `--connect` lines are read from stdin. Counts are printed after
//! every batch in complete mode; the query stops when the input ends.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rill::{BacklogPolicy, EngineConfig, MicroBatchEngine, StreamingQuery, Trigger};
use rill_core::pipeline::{col, count, AggregateSpec, Delimiter, PipelineBuilder};
use rill_core::sink::{ConsoleSink, OutputMode};
use rill_core::source::ChannelSource;
use tokio::io::BufReader;
use tracing::info;

/// Counts words arriving on a line-oriented stream.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Read lines from this TCP address instead of stdin
    #[arg(long)]
    connect: Option<String>,

    /// Trigger interval in milliseconds (0 = back to back)
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Rows printed per batch
    #[arg(long, default_value_t = 20)]
    max_rows: usize,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "rill=info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    rill::telemetry::init_tracing(&args.log_filter);

    let (source, lines) = ChannelSource::lines(4096);

    let mut builder = PipelineBuilder::new(lines.schema().clone());
    let words = builder.explode(builder.source(), "value", Delimiter::Whitespace)?;
    let words = builder.project(words, vec![("word", col("value").lower())])?;
    builder.aggregate(
        "word_counts",
        words,
        AggregateSpec::new()
            .group_by("word")
            .aggregate(count().alias("count")),
        OutputMode::Complete,
    )?;
    let pipeline = builder.build()?;

    let config = EngineConfig::new("socket_word_count").with_backlog(BacklogPolicy::CatchUp);

    let engine = MicroBatchEngine::builder(pipeline, source)
        .config(config)
        .default_sink(
            ConsoleSink::stdout()
                .with_max_rows(args.max_rows)
                .with_skip_empty(true),
        )
        .build()?;

    let reader = match &args.connect {
        Some(addr) => {
            info!(%addr, "connecting");
            let stream = tokio::net::TcpStream::connect(addr).await?;
            lines.spawn_line_reader(BufReader::new(stream))
        }
        None => lines.spawn_line_reader(BufReader::new(tokio::io::stdin())),
    };
    // The reader task holds its own handle; the source is exhausted once it ends
    drop(lines);

    let trigger = Trigger::processing_time(Duration::from_millis(args.interval_ms));
    let query = StreamingQuery::start(engine, trigger);

    let stop = query.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.trigger();
        }
    });

    let summary = query.await_termination().await?;
    if reader.is_finished() {
        let read = reader.await??;
        info!(lines = read, "input ended");
    } else {
        reader.abort();
    }
    info!(
        batches = summary.batches,
        rows = summary.input_rows,
        reason = ?summary.reason,
        "done"
    );
    Ok(())
}
