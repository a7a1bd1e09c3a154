//! End-to-end query tests: pipelines driven by the engine and the
//! scheduler, with in-memory sources and sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rill::{
    BacklogPolicy, EngineConfig, EngineError, MicroBatchEngine, RetryPolicy, StopReason,
    StreamingQuery, Trigger,
};
use rill_core::pipeline::{
    col, count, lit, sum, AggregateSpec, Delimiter, JoinType, PipelineBuilder, StaticTable,
    StaticTableHandle, Window,
};
use rill_core::schema::{DataType, Field, Schema, SchemaRef};
use rill_core::sink::{MemorySink, MemorySinkHandle, OutputMode};
use rill_core::source::{
    MemorySource, MemorySourceHandle, SourceAdapter, SourceBatch, SourceError,
};
use rill_core::state::StateStore;
use rill_core::{Offset, Record, Value};

fn lines_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]))
}

fn line(text: &str) -> Record {
    Record::new(vec![Value::from(text)])
}

fn word_count_engine(
    mode: OutputMode,
    config: EngineConfig,
) -> (MicroBatchEngine, MemorySourceHandle, MemorySinkHandle) {
    let mut b = PipelineBuilder::new(lines_schema());
    let words = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
    let words = b.project(words, vec![("word", col("value").lower())]).unwrap();
    b.aggregate(
        "word_counts",
        words,
        AggregateSpec::new().group_by("word").aggregate(count().alias("count")),
        mode,
    )
    .unwrap();

    let (source, input) = MemorySource::new(lines_schema());
    let (sink, output) = MemorySink::new();
    let engine = MicroBatchEngine::builder(b.build().unwrap(), source)
        .config(config)
        .sink("word_counts", sink)
        .build()
        .unwrap();
    (engine, input, output)
}

fn word_rows(rows: &[Record]) -> Vec<(String, i64)> {
    rows.iter()
        .map(|r| {
            (
                r.get(0).as_str().unwrap().to_string(),
                r.get(1).as_i64().unwrap(),
            )
        })
        .collect()
}

fn pairs(expected: &[(&str, i64)]) -> Vec<(String, i64)> {
    expected.iter().map(|(w, c)| ((*w).to_string(), *c)).collect()
}

/// Fails the first `failures` polls with a transient error.
struct FlakySource {
    inner: MemorySource,
    failures: usize,
}

#[async_trait]
impl SourceAdapter for FlakySource {
    fn name(&self) -> &str {
        "flaky"
    }

    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    async fn poll(
        &mut self,
        last_offset: Offset,
        max_records: usize,
    ) -> Result<SourceBatch, SourceError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SourceError::Unavailable("broker restarting".into()));
        }
        self.inner.poll(last_offset, max_records).await
    }

    async fn commit(&mut self, offset: Offset) -> Result<(), SourceError> {
        self.inner.commit(offset).await
    }
}

fn flaky_engine(
    failures: usize,
    config: EngineConfig,
) -> (MicroBatchEngine, MemorySourceHandle, MemorySinkHandle) {
    let mut b = PipelineBuilder::new(lines_schema());
    b.output("echo", b.source(), OutputMode::Append).unwrap();
    let (inner, input) = MemorySource::new(lines_schema());
    let (sink, output) = MemorySink::new();
    let engine = MicroBatchEngine::builder(b.build().unwrap(), FlakySource { inner, failures })
        .config(config)
        .default_sink(sink)
        .build()
        .unwrap();
    (engine, input, output)
}

// ── Word count across batches ──

#[tokio::test]
async fn test_word_count_complete_mode() {
    let (mut engine, input, output) =
        word_count_engine(OutputMode::Complete, EngineConfig::new("wc"));

    input.push_all([line("hello world"), line("Hello")]);
    engine.run_once().await.unwrap().unwrap();
    assert_eq!(
        word_rows(&output.last("word_counts").unwrap().rows),
        pairs(&[("hello", 2), ("world", 1)])
    );

    input.push(line("world peace"));
    let progress = engine.run_once().await.unwrap().unwrap();
    assert_eq!(progress.batch_id, 2);
    assert_eq!(progress.start_offset, 2);
    assert_eq!(progress.end_offset, 3);
    assert_eq!(
        word_rows(&output.last("word_counts").unwrap().rows),
        pairs(&[("hello", 2), ("peace", 1), ("world", 2)])
    );
}

#[tokio::test]
async fn test_update_mode_emits_changed_groups_only() {
    let (mut engine, input, output) =
        word_count_engine(OutputMode::Update, EngineConfig::new("wc"));

    input.push(line("a b c"));
    engine.run_once().await.unwrap();
    input.push(line("b b"));
    engine.run_once().await.unwrap();

    let batches = output.batches_for("word_counts");
    assert_eq!(batches.len(), 2);
    assert_eq!(word_rows(&batches[1].rows), pairs(&[("b", 3)]));
    assert_eq!(batches[1].mode, OutputMode::Update);
}

#[tokio::test]
async fn test_blank_lines_produce_no_words() {
    let (mut engine, input, output) =
        word_count_engine(OutputMode::Complete, EngineConfig::new("wc"));
    input.push_all([line(""), line("   ")]);
    let progress = engine.run_once().await.unwrap().unwrap();
    assert_eq!(progress.input_rows, 2);
    assert!(output.last("word_counts").unwrap().is_empty());
    assert!(engine.store().is_empty());
}

// ── Windowed aggregation with watermarks ──

#[tokio::test]
async fn test_windowed_append_finalizes_each_window_once() {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("sensor", DataType::Utf8, false),
        Field::new("reading", DataType::Int64, false),
        Field::new("ts", DataType::Timestamp, false),
    ]));
    let mut b = PipelineBuilder::new(Arc::clone(&schema));
    b.aggregate(
        "per_minute",
        b.source(),
        AggregateSpec::new()
            .group_by("sensor")
            .aggregate(sum("reading").alias("total"))
            .window(
                Window::tumbling("ts", Duration::from_secs(60))
                    .with_allowed_lateness(Duration::from_secs(10)),
            ),
        OutputMode::Append,
    )
    .unwrap();

    let (source, input) = MemorySource::new(schema);
    let (sink, output) = MemorySink::new();
    let mut engine = MicroBatchEngine::builder(b.build().unwrap(), source)
        .default_sink(sink)
        .build()
        .unwrap();

    let reading = |sensor: &str, value: i64, ts: i64| {
        Record::new(vec![
            Value::from(sensor),
            Value::Int64(value),
            Value::Timestamp(ts),
        ])
    };

    input.push_all([reading("s1", 3, 5_000), reading("s1", 4, 50_000)]);
    let first = engine.run_once().await.unwrap().unwrap();
    assert_eq!(first.watermarks["per_minute"], 40_000);
    assert_eq!(first.output_rows["per_minute"], 0);

    // Watermark 65s closes [0, 60s)
    input.push(reading("s1", 1, 75_000));
    engine.run_once().await.unwrap();
    assert_eq!(
        output.last("per_minute").unwrap().rows,
        vec![Record::new(vec![
            Value::from("s1"),
            Value::Timestamp(0),
            Value::Timestamp(60_000),
            Value::Int64(7),
        ])]
    );
    assert_eq!(engine.committed().watermark("per_minute"), Some(65_000));

    // A late reading for the closed window is dropped
    input.push(reading("s1", 100, 30_000));
    let late = engine.run_once().await.unwrap().unwrap();
    assert_eq!(late.late_rows, 1);
    assert_eq!(late.output_rows["per_minute"], 0);
    assert_eq!(output.rows("per_minute").len(), 1);
}

// ── Static joins ──

fn users_table(rows: Vec<(i64, &str)>) -> StaticTable {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("country", DataType::Utf8, false),
    ]));
    let rows = rows
        .into_iter()
        .map(|(id, country)| Record::new(vec![Value::Int64(id), Value::from(country)]))
        .collect();
    StaticTable::new(schema, "id", rows).unwrap()
}

fn clicks_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Int64, true),
        Field::new("page", DataType::Utf8, false),
    ]))
}

fn click(user: Option<i64>, page: &str) -> Record {
    Record::new(vec![user.map_or(Value::Null, Value::Int64), Value::from(page)])
}

#[tokio::test]
async fn test_static_join_enriches_and_aggregates() {
    let users = StaticTableHandle::new(users_table(vec![(1, "NZ"), (2, "FR")]));
    let mut b = PipelineBuilder::new(clicks_schema());
    let enriched = b
        .join_static(b.source(), &users, "user_id", JoinType::Left)
        .unwrap();
    b.output("enriched", enriched, OutputMode::Append).unwrap();
    let matched = b
        .join_static(b.source(), &users, "user_id", JoinType::Inner)
        .unwrap();
    b.aggregate(
        "by_country",
        matched,
        AggregateSpec::new().group_by("country").aggregate(count().alias("clicks")),
        OutputMode::Complete,
    )
    .unwrap();

    let (source, input) = MemorySource::new(clicks_schema());
    let (enriched_sink, enriched_out) = MemorySink::new();
    let (country_sink, country_out) = MemorySink::new();
    let mut engine = MicroBatchEngine::builder(b.build().unwrap(), source)
        .sink("enriched", enriched_sink)
        .sink("by_country", country_sink)
        .build()
        .unwrap();

    input.push_all([
        click(Some(1), "/home"),
        click(Some(3), "/cart"),
        click(None, "/about"),
        click(Some(2), "/home"),
    ]);
    engine.run_once().await.unwrap();

    assert_eq!(
        enriched_out.rows("enriched"),
        vec![
            Record::new(vec![Value::Int64(1), Value::from("/home"), Value::from("NZ")]),
            Record::new(vec![Value::Int64(3), Value::from("/cart"), Value::Null]),
            Record::new(vec![Value::Null, Value::from("/about"), Value::Null]),
            Record::new(vec![Value::Int64(2), Value::from("/home"), Value::from("FR")]),
        ]
    );
    assert_eq!(
        word_rows(&country_out.last("by_country").unwrap().rows),
        pairs(&[("FR", 1), ("NZ", 1)])
    );

    // Reloaded table applies from the next batch on
    users
        .reload(users_table(vec![(1, "NZ"), (2, "FR"), (3, "JP")]))
        .unwrap();
    input.push(click(Some(3), "/cart"));
    engine.run_once().await.unwrap();
    assert_eq!(
        word_rows(&country_out.last("by_country").unwrap().rows),
        pairs(&[("FR", 1), ("JP", 1), ("NZ", 1)])
    );
}

// ── Shared stages ──

#[tokio::test]
async fn test_outputs_share_a_filtered_prefix() {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("user", DataType::Utf8, false),
        Field::new("amount", DataType::Int64, false),
    ]));
    let mut b = PipelineBuilder::new(Arc::clone(&schema));
    let large = b.filter(b.source(), col("amount").gt_eq(lit(100i64))).unwrap();
    b.output("large", large, OutputMode::Append).unwrap();
    let large_again = b.filter(b.source(), col("amount").gt_eq(lit(100i64))).unwrap();
    assert_eq!(large, large_again);
    b.aggregate(
        "large_by_user",
        large_again,
        AggregateSpec::new().group_by("user").aggregate(sum("amount").alias("total")),
        OutputMode::Update,
    )
    .unwrap();

    let (source, input) = MemorySource::new(schema);
    let (sink, output) = MemorySink::new();
    let mut engine = MicroBatchEngine::builder(b.build().unwrap(), source)
        .default_sink(sink)
        .build()
        .unwrap();

    let payment = |user: &str, amount: i64| Record::new(vec![Value::from(user), Value::Int64(amount)]);
    input.push_all([payment("ann", 150), payment("bob", 20), payment("ann", 100)]);
    let progress = engine.run_once().await.unwrap().unwrap();

    assert_eq!(progress.stages_evaluated, 1);
    assert_eq!(progress.output_rows["large"], 2);
    assert_eq!(
        word_rows(&output.last("large_by_user").unwrap().rows),
        pairs(&[("ann", 250)])
    );
}

// ── Sink failures ──

#[tokio::test]
async fn test_sink_failure_keeps_state_exactly_once() {
    let config = EngineConfig::new("wc").with_sink_retry(RetryPolicy::fixed(1, Duration::ZERO));
    let (mut engine, input, output) = word_count_engine(OutputMode::Complete, config);

    input.push(line("x y"));
    engine.run_once().await.unwrap();

    input.push(line("x"));
    output.fail_next(2);
    let err = engine.run_once().await.unwrap_err();
    assert!(matches!(err, EngineError::Sink { .. }));
    assert!(err.is_transient());
    assert_eq!(engine.committed().batch_id, 1);

    let progress = engine.run_once().await.unwrap().unwrap();
    assert_eq!(progress.batch_id, 2);
    assert_eq!(
        word_rows(&output.last("word_counts").unwrap().rows),
        pairs(&[("x", 2), ("y", 1)])
    );
}

// ── Scheduler behaviour ──

#[tokio::test]
async fn test_source_retry_rides_out_transient_failures() {
    let config = EngineConfig::new("flaky").with_source_retry(RetryPolicy::fixed(3, Duration::ZERO));
    let (engine, input, output) = flaky_engine(2, config);
    input.push_all([line("a"), line("b")]);

    let summary = StreamingQuery::start(engine, Trigger::AvailableNow)
        .await_termination()
        .await
        .unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.restarts, 0);
    assert_eq!(output.rows("echo"), vec![line("a"), line("b")]);
}

#[tokio::test]
async fn test_source_retry_exhaustion_fails_query() {
    let config = EngineConfig::new("flaky").with_source_retry(RetryPolicy::fixed(2, Duration::ZERO));
    let (engine, input, output) = flaky_engine(10, config);
    input.push(line("a"));

    let err = StreamingQuery::start(engine, Trigger::AvailableNow)
        .await_termination()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Source {
            error: SourceError::Unavailable(_),
            ..
        }
    ));
    assert!(output.batches().is_empty());
    assert!(output.is_closed());
}

#[tokio::test]
async fn test_restart_policy_reruns_failed_batches() {
    let config = EngineConfig::new("restart")
        .with_source_retry(RetryPolicy::none())
        .with_restart(RetryPolicy::fixed(5, Duration::from_millis(1)));
    let (engine, input, output) = flaky_engine(3, config);
    input.push_all([line("a"), line("b"), line("c")]);

    let summary = StreamingQuery::start(engine, Trigger::AvailableNow)
        .await_termination()
        .await
        .unwrap();
    assert_eq!(summary.restarts, 3);
    assert_eq!(summary.reason, StopReason::Completed);
    assert_eq!(output.rows("echo").len(), 3);
}

#[tokio::test]
async fn test_schema_mismatch_stops_query_without_commit() {
    let (engine, input, output) = word_count_engine(OutputMode::Complete, EngineConfig::new("wc"));
    input.push(line("fine"));
    input.push(Record::new(vec![Value::Int64(42)]));

    let err = StreamingQuery::start(engine, Trigger::AvailableNow)
        .await_termination()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaMismatch { offset: 2, .. }));
    assert!(output.batches().is_empty());
    assert_eq!(input.retained(), 2);
}

#[tokio::test]
async fn test_catch_up_drains_backlog_between_ticks() {
    let config = EngineConfig::new("catch_up")
        .with_max_records_per_batch(2)
        .with_backlog(BacklogPolicy::CatchUp);
    let (engine, input, _output) = word_count_engine(OutputMode::Update, config);
    input.push_all((0..7).map(|i| line(&format!("w{i}"))));

    let handle = StreamingQuery::start(engine, Trigger::processing_time(Duration::from_secs(3600)));
    // One tick fires immediately; catch-up runs the rest without waiting
    let report = handle.await_batch(4).await.unwrap();
    assert_eq!(report.end_offset, 7);
    assert_eq!(report.input_rows, 1);

    handle.stop();
    let summary = handle.await_termination().await.unwrap();
    assert_eq!(summary.batches, 4);
}

#[tokio::test]
async fn test_skip_tick_waits_for_next_tick() {
    let config = EngineConfig::new("skip").with_max_records_per_batch(2);
    let (engine, input, _output) = word_count_engine(OutputMode::Update, config);
    input.push_all((0..5).map(|i| line(&format!("w{i}"))));

    let handle = StreamingQuery::start(engine, Trigger::processing_time(Duration::from_secs(3600)));
    handle.await_batch(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.last_progress().unwrap().batch_id, 1);

    handle.trigger_now();
    let second = handle.await_batch(2).await.unwrap();
    assert_eq!(second.end_offset, 4);

    handle.stop();
    handle.await_termination().await.unwrap();
}

#[tokio::test]
async fn test_continuous_query_processes_new_input() {
    let (engine, input, output) =
        word_count_engine(OutputMode::Complete, EngineConfig::new("continuous"));
    let handle = StreamingQuery::start(engine, Trigger::continuous());

    input.push(line("one two"));
    handle.await_batch(1).await.unwrap();
    input.push(line("two"));
    handle.await_batch(2).await.unwrap();

    handle.stop();
    let summary = handle.await_termination().await.unwrap();
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(
        word_rows(&output.last("word_counts").unwrap().rows),
        pairs(&[("one", 1), ("two", 2)])
    );
}
