//! Per-batch pipeline evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashMap;

use super::builder::{AggregatePlan, Output, PhysicalOp, Pipeline};
use super::join::{StaticTable, StaticTableHandle};
use super::ExecError;
use crate::aggregate::{AggregateState, Position};
use crate::record::{Offset, Record, Value};
use crate::schema::SchemaRef;
use crate::sink::OutputMode;
use crate::state::{decode, encode, StateStore, WriteBatch};

/// Tuple of group column values, followed by the window start when the
/// aggregation is windowed.
pub type GroupKey = Vec<Value>;

/// One micro-batch handed to [`Pipeline::execute`].
#[derive(Debug, Clone, Copy)]
pub struct BatchInput<'a> {
    /// Batch id being computed.
    pub batch_id: u64,
    /// Offset committed before this batch; `records[0]` has offset
    /// `start_offset + 1`.
    pub start_offset: Offset,
    /// Records of the batch in offset order.
    pub records: &'a [Record],
    /// Watermarks as of the previous commit, `(output, millis)`.
    pub watermarks: &'a [(String, i64)],
}

/// Rows one output emits for a batch.
#[derive(Debug, Clone)]
pub struct OutputRows {
    /// Output name.
    pub name: String,
    /// Output mode.
    pub mode: OutputMode,
    /// Row schema.
    pub schema: SchemaRef,
    /// Rows to emit, ordered by group key for aggregated outputs.
    pub rows: Vec<Record>,
}

/// Everything a batch produced. Nothing is applied to the store yet.
#[derive(Debug)]
pub struct BatchResult {
    /// One entry per output, in declaration order.
    pub outputs: Vec<OutputRows>,
    /// State deltas to commit.
    pub writes: WriteBatch,
    /// Watermarks after this batch, one per windowed output that has one.
    pub watermarks: Vec<(String, i64)>,
    /// Non-source stages evaluated.
    pub stages_evaluated: usize,
    /// Rows dropped because their window was already final.
    pub late_rows: u64,
}

#[derive(Debug, Clone)]
struct Row {
    position: Position,
    record: Record,
}

/// Assigns positions to rows derived from the same source record.
///
/// Rows of one source offset are adjacent and keep their relative order
/// through every stage, so a running counter keeps positions ordered.
#[derive(Default)]
struct Renumber {
    offset: Option<Offset>,
    next: u32,
}

impl Renumber {
    fn next(&mut self, offset: Offset) -> Position {
        if self.offset != Some(offset) {
            self.offset = Some(offset);
            self.next = 0;
        }
        let position = Position::new(offset, self.next);
        self.next = self.next.saturating_add(1);
        position
    }
}

fn state_key(output: u16, key: &GroupKey) -> Result<Vec<u8>, ExecError> {
    let encoded = encode(key)?;
    let mut bytes = Vec::with_capacity(2 + encoded.len());
    bytes.extend_from_slice(&output.to_be_bytes());
    bytes.extend_from_slice(&encoded);
    Ok(bytes)
}

impl Pipeline {
    /// Evaluates one batch against the state in `store`.
    ///
    /// Each stage some output needs is evaluated once, whatever the number
    /// of outputs reading it. The store is only read; the returned
    /// [`BatchResult::writes`] holds the deltas to commit.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if an expression fails or stored state cannot
    /// be decoded. The store is untouched either way.
    pub fn execute(
        &self,
        input: &BatchInput<'_>,
        store: &dyn StateStore,
    ) -> Result<BatchResult, ExecError> {
        let needed = self.required_stages();
        let mut tables: Vec<(StaticTableHandle, Arc<StaticTable>)> = Vec::new();
        let mut results: Vec<Option<Arc<Vec<Row>>>> = vec![None; self.stages.len()];
        let mut stages_evaluated = 0;

        for (idx, stage) in self.stages.iter().enumerate() {
            if !needed[idx] {
                continue;
            }
            let rows = match (&stage.physical, stage.input) {
                (PhysicalOp::Source, _) => input
                    .records
                    .iter()
                    .zip(input.start_offset + 1..)
                    .map(|(record, offset)| Row {
                        position: Position::new(offset, 0),
                        record: record.clone(),
                    })
                    .collect(),
                (op, Some(parent)) => {
                    let parent_rows = results[parent.index()].clone().unwrap_or_default();
                    stages_evaluated += 1;
                    apply(op, &parent_rows, &mut tables)?
                }
                (_, None) => Vec::new(),
            };
            results[idx] = Some(Arc::new(rows));
        }

        let mut outputs = Vec::with_capacity(self.outputs.len());
        let mut writes = WriteBatch::new();
        let mut watermarks = Vec::new();
        let mut late_rows = 0;

        for (idx, output) in self.outputs.iter().enumerate() {
            let rows = results[output.stage().index()].clone().unwrap_or_default();
            let emitted = match &output.aggregation {
                None => rows.iter().map(|r| r.record.clone()).collect(),
                Some(plan) => {
                    let output_idx = u16::try_from(idx).unwrap_or(u16::MAX);
                    let previous = input
                        .watermarks
                        .iter()
                        .find(|(name, _)| name == output.name())
                        .map(|(_, wm)| *wm);
                    let outcome = self.aggregate(
                        output_idx, output, plan, &rows, previous, store, &mut writes,
                    )?;
                    if outcome.late_rows > 0 {
                        tracing::warn!(
                            batch_id = input.batch_id,
                            output = output.name(),
                            late_rows = outcome.late_rows,
                            "dropped late rows"
                        );
                    }
                    late_rows += outcome.late_rows;
                    if let Some(wm) = outcome.watermark {
                        watermarks.push((output.name().to_string(), wm));
                    }
                    outcome.rows
                }
            };
            outputs.push(OutputRows {
                name: output.name().to_string(),
                mode: output.mode(),
                schema: Arc::clone(output.schema()),
                rows: emitted,
            });
        }

        tracing::debug!(
            batch_id = input.batch_id,
            records = input.records.len(),
            stages_evaluated,
            state_writes = writes.len(),
            "batch evaluated"
        );

        Ok(BatchResult {
            outputs,
            writes,
            watermarks,
            stages_evaluated,
            late_rows,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &self,
        output_idx: u16,
        output: &Output,
        plan: &AggregatePlan,
        rows: &[Row],
        previous_watermark: Option<i64>,
        store: &dyn StateStore,
        writes: &mut WriteBatch,
    ) -> Result<AggregateOutcome, ExecError> {
        let mut keyed = Vec::with_capacity(rows.len());
        let mut late_rows = 0;
        let mut max_event_time: Option<i64> = None;

        for row in rows {
            let mut key: GroupKey = plan
                .group_indices
                .iter()
                .map(|&i| row.record.get(i).clone())
                .collect();
            if let Some(window) = &plan.window {
                let Some(ts) = row.record.get(window.time_index).as_i64() else {
                    late_rows += 1;
                    continue;
                };
                let start = window.start_of(ts);
                if previous_watermark.is_some_and(|wm| window.end_of(start) <= wm) {
                    late_rows += 1;
                    continue;
                }
                max_event_time = Some(max_event_time.map_or(ts, |m| m.max(ts)));
                key.push(Value::Timestamp(start));
            }
            let inputs: Vec<Value> = plan
                .inputs
                .iter()
                .map(|i| i.map_or(Value::Null, |i| row.record.get(i).clone()))
                .collect();
            keyed.push((key, row.position, inputs));
        }

        let partials = fold_partitioned(keyed, plan, &self.config)?;

        let prefix = output_idx.to_be_bytes();
        let mut changed: BTreeMap<GroupKey, (Vec<u8>, AggregateState)> = BTreeMap::new();
        for (key, partial) in partials {
            let key_bytes = state_key(output_idx, &key)?;
            let state = match store.get(&key_bytes) {
                Some(bytes) => {
                    let mut stored: AggregateState = decode(&bytes)?;
                    stored.merge(&partial);
                    stored
                }
                None => partial,
            };
            changed.insert(key, (key_bytes, state));
        }

        let watermark = match (&plan.window, max_event_time) {
            (Some(window), Some(max_ts)) => {
                let candidate = max_ts.saturating_sub(window.lateness_ms);
                Some(previous_watermark.map_or(candidate, |wm| wm.max(candidate)))
            }
            _ => previous_watermark,
        };

        let needs_full_view = output.mode() == OutputMode::Complete
            || (plan.window.is_some() && watermark.is_some());
        let mut view: BTreeMap<GroupKey, (Vec<u8>, AggregateState)> = BTreeMap::new();
        if needs_full_view {
            for (key_bytes, state_bytes) in store.prefix_scan(&prefix) {
                let key: GroupKey = decode(&key_bytes[prefix.len()..])?;
                if changed.contains_key(&key) {
                    continue;
                }
                view.insert(key, (key_bytes.to_vec(), decode(&state_bytes)?));
            }
        }

        let is_final = |key: &GroupKey| match (&plan.window, watermark, key.last()) {
            (Some(window), Some(wm), Some(Value::Timestamp(start))) => window.end_of(*start) <= wm,
            _ => false,
        };

        let mut emit = Vec::new();
        match output.mode() {
            OutputMode::Complete => {
                for (key_bytes, state) in changed.values() {
                    writes.put(key_bytes.clone(), encode(state)?.to_vec());
                }
                view.extend(changed);
                emit.extend(view.iter().map(|(k, (_, s))| result_row(plan, k, s)));
            }
            OutputMode::Update => {
                for (key, (key_bytes, state)) in &changed {
                    emit.push(result_row(plan, key, state));
                    if is_final(key) {
                        writes.delete(key_bytes.clone());
                    } else {
                        writes.put(key_bytes.clone(), encode(state)?.to_vec());
                    }
                }
                for (key, (key_bytes, _)) in &view {
                    if is_final(key) {
                        writes.delete(key_bytes.clone());
                    }
                }
            }
            OutputMode::Append => {
                view.extend(changed.iter().map(|(k, v)| (k.clone(), v.clone())));
                for (key, (key_bytes, state)) in &view {
                    if is_final(key) {
                        emit.push(result_row(plan, key, state));
                        writes.delete(key_bytes.clone());
                    } else if changed.contains_key(key) {
                        writes.put(key_bytes.clone(), encode(state)?.to_vec());
                    }
                }
            }
        }

        Ok(AggregateOutcome {
            rows: emit,
            watermark,
            late_rows,
        })
    }
}

struct AggregateOutcome {
    rows: Vec<Record>,
    watermark: Option<i64>,
    late_rows: u64,
}

fn result_row(plan: &AggregatePlan, key: &GroupKey, state: &AggregateState) -> Record {
    let mut values = Vec::with_capacity(key.len() + 1 + state.accumulators.len());
    match (&plan.window, key.split_last()) {
        (Some(window), Some((Value::Timestamp(start), groups))) => {
            values.extend(groups.iter().cloned());
            values.push(Value::Timestamp(*start));
            values.push(Value::Timestamp(window.end_of(*start)));
        }
        _ => values.extend(key.iter().cloned()),
    }
    values.extend(state.finish());
    Record::new(values)
}

type Keyed = (GroupKey, Position, Vec<Value>);

fn fold(rows: impl IntoIterator<Item = Keyed>, plan: &AggregatePlan) -> FxHashMap<GroupKey, AggregateState> {
    let mut groups: FxHashMap<GroupKey, AggregateState> = FxHashMap::default();
    for (key, position, inputs) in rows {
        groups
            .entry(key)
            .or_insert_with(|| AggregateState::new(&plan.functions))
            .update(&inputs, position);
    }
    groups
}

/// Folds rows into per-key partial states.
///
/// With more than one worker, rows are partitioned by the hash of their
/// group key so each key is folded by exactly one thread.
fn fold_partitioned(
    keyed: Vec<Keyed>,
    plan: &AggregatePlan,
    config: &super::PipelineConfig,
) -> Result<FxHashMap<GroupKey, AggregateState>, ExecError> {
    let workers = config.parallelism.max(1);
    if workers == 1 || keyed.len() < config.parallel_threshold {
        return Ok(fold(keyed, plan));
    }

    let mut partitions: Vec<Vec<Keyed>> = (0..workers).map(|_| Vec::new()).collect();
    for item in keyed {
        #[allow(clippy::cast_possible_truncation)]
        let slot = (fxhash::hash64(&item.0) % workers as u64) as usize;
        partitions[slot].push(item);
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .into_iter()
            .map(|part| scope.spawn(move || fold(part, plan)))
            .collect();
        let mut merged = FxHashMap::default();
        for handle in handles {
            let groups = handle.join().map_err(|_| ExecError::WorkerPanicked)?;
            merged.extend(groups);
        }
        Ok(merged)
    })
}

fn apply(
    op: &PhysicalOp,
    rows: &[Row],
    tables: &mut Vec<(StaticTableHandle, Arc<StaticTable>)>,
) -> Result<Vec<Row>, ExecError> {
    match op {
        PhysicalOp::Source => Ok(rows.to_vec()),
        PhysicalOp::Project(exprs) => rows
            .iter()
            .map(|row| {
                let values = exprs
                    .iter()
                    .map(|e| e.evaluate(&row.record))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Row {
                    position: row.position,
                    record: Record::new(values),
                })
            })
            .collect(),
        PhysicalOp::Filter(predicate) => {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if predicate.matches(&row.record)? {
                    out.push(row.clone());
                }
            }
            Ok(out)
        }
        PhysicalOp::Explode { column, delimiter } => {
            let mut out = Vec::new();
            let mut renumber = Renumber::default();
            for row in rows {
                let Some(text) = row.record.get(*column).as_str() else {
                    continue;
                };
                for token in delimiter.split(text) {
                    let mut values = row.record.values().to_vec();
                    values[*column] = Value::Utf8(token.to_string());
                    out.push(Row {
                        position: renumber.next(row.position.offset),
                        record: Record::new(values),
                    });
                }
            }
            Ok(out)
        }
        PhysicalOp::JoinStatic {
            table,
            stream_key,
            join_type,
        } => {
            let snapshot = snapshot_for(table, tables);
            let mut out = Vec::with_capacity(rows.len());
            let mut renumber = Renumber::default();
            for row in rows {
                let mut matched = false;
                for hit in snapshot.lookup(row.record.get(*stream_key)) {
                    matched = true;
                    let mut values = row.record.values().to_vec();
                    values.extend(snapshot.payload(hit).cloned());
                    out.push(Row {
                        position: renumber.next(row.position.offset),
                        record: Record::new(values),
                    });
                }
                if !matched && join_type.emits_on_miss() {
                    let mut values = row.record.values().to_vec();
                    values.resize(values.len() + snapshot.payload_width(), Value::Null);
                    out.push(Row {
                        position: renumber.next(row.position.offset),
                        record: Record::new(values),
                    });
                }
            }
            Ok(out)
        }
    }
}

/// One snapshot per handle per batch.
fn snapshot_for(
    handle: &StaticTableHandle,
    tables: &mut Vec<(StaticTableHandle, Arc<StaticTable>)>,
) -> Arc<StaticTable> {
    if let Some((_, table)) = tables.iter().find(|(h, _)| h == handle) {
        return Arc::clone(table);
    }
    let table = handle.snapshot();
    tables.push((handle.clone(), Arc::clone(&table)));
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        col, count, lit, sum, AggregateSpec, Delimiter, JoinType, PipelineBuilder,
        PipelineConfig, StaticTable, Window,
    };
    use crate::record;
    use crate::schema::{DataType, Field, Schema};
    use crate::state::{CommitMarker, InMemoryStore};
    use std::time::Duration;

    fn word_count(mode: OutputMode) -> Pipeline {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]));
        let mut b = PipelineBuilder::new(schema);
        let words = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
        let words = b.project(words, vec![("word", col("value").lower())]).unwrap();
        b.aggregate(
            "counts",
            words,
            AggregateSpec::new().group_by("word").aggregate(count().alias("count")),
            mode,
        )
        .unwrap();
        b.build().unwrap()
    }

    /// Runs a batch and commits it like the engine does.
    fn run(
        pipeline: &Pipeline,
        store: &mut InMemoryStore,
        batch_id: u64,
        records: &[Record],
    ) -> BatchResult {
        let start_offset = store.last_commit().map_or(0, |c| c.end_offset);
        let watermarks = store
            .last_commit()
            .map(|c| c.watermarks.clone())
            .unwrap_or_default();
        let result = pipeline
            .execute(
                &BatchInput {
                    batch_id,
                    start_offset,
                    records,
                    watermarks: &watermarks,
                },
                store,
            )
            .unwrap();
        let mut writes = result.writes.clone();
        writes.commit(
            CommitMarker::new(batch_id, start_offset + records.len() as u64)
                .with_watermarks(result.watermarks.clone()),
        );
        store.write_batch(writes).unwrap();
        result
    }

    fn counts(result: &BatchResult) -> Vec<(String, i64)> {
        result.outputs[0]
            .rows
            .iter()
            .map(|r| {
                (
                    r.get(0).as_str().unwrap().to_string(),
                    r.get(1).as_i64().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_word_count_complete() {
        let pipeline = word_count(OutputMode::Complete);
        let mut store = InMemoryStore::new();

        let r1 = run(&pipeline, &mut store, 1, &[record!("a b")]);
        assert_eq!(counts(&r1), vec![("a".into(), 1), ("b".into(), 1)]);

        let r2 = run(&pipeline, &mut store, 2, &[record!("B c")]);
        assert_eq!(
            counts(&r2),
            vec![("a".into(), 1), ("b".into(), 2), ("c".into(), 1)]
        );
        assert_eq!(r2.stages_evaluated, 2);
    }

    #[test]
    fn test_word_count_update_emits_changed_groups_only() {
        let pipeline = word_count(OutputMode::Update);
        let mut store = InMemoryStore::new();
        run(&pipeline, &mut store, 1, &[record!("a b")]);
        let r2 = run(&pipeline, &mut store, 2, &[record!("b c")]);
        assert_eq!(counts(&r2), vec![("b".into(), 2), ("c".into(), 1)]);
    }

    #[test]
    fn test_execute_does_not_touch_store() {
        let pipeline = word_count(OutputMode::Complete);
        let store = InMemoryStore::new();
        let records = [record!("x")];
        let result = pipeline
            .execute(
                &BatchInput {
                    batch_id: 1,
                    start_offset: 0,
                    records: &records,
                    watermarks: &[],
                },
                &store,
            )
            .unwrap();
        assert_eq!(result.writes.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_shared_prefix_is_evaluated_once() {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]));
        let mut b = PipelineBuilder::new(schema);
        let words = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
        let lower = b.project(words, vec![("word", col("value").lower())]).unwrap();
        b.aggregate(
            "counts",
            lower,
            AggregateSpec::new().group_by("word").aggregate(count()),
            OutputMode::Complete,
        )
        .unwrap();
        let again = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
        let again = b.project(again, vec![("word", col("value").lower())]).unwrap();
        let long = b.filter(again, col("word").length().gt(lit(3i64))).unwrap();
        b.output("long_words", long, OutputMode::Append).unwrap();
        let pipeline = b.build().unwrap();

        let mut store = InMemoryStore::new();
        let result = run(&pipeline, &mut store, 1, &[record!("Spark streams data")]);
        // explode + project + filter, not 5
        assert_eq!(result.stages_evaluated, 3);
        let long: Vec<_> = result.outputs[1].rows.iter().map(|r| r.get(0).clone()).collect();
        assert_eq!(long, vec![Value::from("spark"), Value::from("streams"), Value::from("data")]);
    }

    fn orders_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("userid", DataType::Int64, false),
            Field::new("cost", DataType::Float64, false),
        ]))
    }

    fn users() -> StaticTableHandle {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        StaticTableHandle::new(StaticTable::new(schema, "id", vec![record!(1i64, "Ann")]).unwrap())
    }

    fn spend_by_name(join_type: JoinType) -> Pipeline {
        let mut b = PipelineBuilder::new(orders_schema());
        let joined = b
            .join_static(b.source(), &users(), "userid", join_type)
            .unwrap();
        b.aggregate(
            "spend",
            joined,
            AggregateSpec::new().group_by("name").aggregate(sum("cost")),
            OutputMode::Complete,
        )
        .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_static_join_inner_and_left() {
        let records = [record!(1i64, 5.0), record!(2i64, 7.0)];

        let mut store = InMemoryStore::new();
        let inner = run(&spend_by_name(JoinType::Inner), &mut store, 1, &records);
        assert_eq!(inner.outputs[0].rows, vec![record!("Ann", 5.0)]);

        let mut store = InMemoryStore::new();
        let left = run(&spend_by_name(JoinType::Left), &mut store, 1, &records);
        assert_eq!(
            left.outputs[0].rows,
            vec![
                Record::new(vec![Value::Null, Value::Float64(7.0)]),
                record!("Ann", 5.0),
            ]
        );
    }

    fn windowed(mode: OutputMode) -> Pipeline {
        let schema = Arc::new(Schema::new(vec![
            Field::new("word", DataType::Utf8, false),
            Field::new("ts", DataType::Timestamp, false),
        ]));
        let mut b = PipelineBuilder::new(schema);
        b.aggregate(
            "windows",
            b.source(),
            AggregateSpec::new()
                .group_by("word")
                .aggregate(count())
                .window(
                    Window::tumbling("ts", Duration::from_secs(10))
                        .with_allowed_lateness(Duration::from_secs(5)),
                ),
            mode,
        )
        .unwrap();
        b.build().unwrap()
    }

    fn ts_row(word: &str, ts: i64) -> Record {
        Record::new(vec![Value::from(word), Value::Timestamp(ts)])
    }

    #[test]
    fn test_windowed_append_emits_each_window_once() {
        let pipeline = windowed(OutputMode::Append);
        let mut store = InMemoryStore::new();

        let r1 = run(
            &pipeline,
            &mut store,
            1,
            &[ts_row("a", 1_000), ts_row("a", 2_000), ts_row("b", 12_000)],
        );
        // watermark = 12s - 5s = 7s, window [0, 10s) still open
        assert!(r1.outputs[0].rows.is_empty());
        assert_eq!(r1.watermarks, vec![("windows".to_string(), 7_000)]);

        let r2 = run(&pipeline, &mut store, 2, &[ts_row("a", 16_000)]);
        // watermark = 11s closes [0, 10s)
        assert_eq!(
            r2.outputs[0].rows,
            vec![Record::new(vec![
                Value::from("a"),
                Value::Timestamp(0),
                Value::Timestamp(10_000),
                Value::Int64(2),
            ])]
        );

        // Late row for the closed window is dropped; nothing is emitted twice.
        let r3 = run(&pipeline, &mut store, 3, &[ts_row("a", 3_000)]);
        assert!(r3.outputs[0].rows.is_empty());
        assert_eq!(r3.late_rows, 1);
        assert_eq!(r3.watermarks, vec![("windows".to_string(), 11_000)]);

        // Closed window state was evicted.
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_windowed_update_evicts_closed_windows() {
        let pipeline = windowed(OutputMode::Update);
        let mut store = InMemoryStore::new();
        run(&pipeline, &mut store, 1, &[ts_row("a", 1_000)]);
        assert_eq!(store.len(), 1);
        let r2 = run(&pipeline, &mut store, 2, &[ts_row("b", 30_000)]);
        assert_eq!(r2.outputs[0].rows.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_parallel_fold_matches_sequential() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        let build = |config: PipelineConfig| {
            let mut b = PipelineBuilder::new(Arc::clone(&schema)).with_config(config);
            b.aggregate(
                "totals",
                b.source(),
                AggregateSpec::new().group_by("k").aggregate(sum("v")).aggregate(count()),
                OutputMode::Complete,
            )
            .unwrap();
            b.build().unwrap()
        };
        let records: Vec<Record> = (0..500i64).map(|i| record!(i % 17, i)).collect();

        let sequential = run(
            &build(PipelineConfig::default()),
            &mut InMemoryStore::new(),
            1,
            &records,
        );
        let parallel = run(
            &build(
                PipelineConfig::default()
                    .with_parallelism(4)
                    .with_parallel_threshold(1),
            ),
            &mut InMemoryStore::new(),
            1,
            &records,
        );
        assert_eq!(sequential.outputs[0].rows, parallel.outputs[0].rows);
        assert_eq!(sequential.outputs[0].rows.len(), 17);
    }

    #[test]
    fn test_overflow_aborts_batch() {
        let mut b = PipelineBuilder::new(orders_schema());
        let s = b
            .project(b.source(), vec![("x", col("userid") * lit(i64::MAX))])
            .unwrap();
        b.output("x", s, OutputMode::Append).unwrap();
        let pipeline = b.build().unwrap();
        let records = [record!(2i64, 1.0)];
        let err = pipeline
            .execute(
                &BatchInput {
                    batch_id: 1,
                    start_offset: 0,
                    records: &records,
                    watermarks: &[],
                },
                &InMemoryStore::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::Overflow(_)));
    }
}
