//! Pipeline graph construction.

use std::sync::Arc;
use std::time::Duration;

use super::expr::{Expr, PhysicalExpr};
use super::join::{JoinType, StaticTableHandle};
use super::{PipelineConfig, PlanError};
use crate::aggregate::AggregateFunction;
use crate::schema::{DataType, Field, Schema, SchemaRef};
use crate::sink::OutputMode;

/// Identifier of a stage inside one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(usize);

impl StageId {
    /// Position of the stage in evaluation order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// How [`PipelineBuilder::explode`] splits a string column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Delimiter {
    /// Any run of Unicode whitespace.
    Whitespace,
    /// A literal separator.
    Str(String),
}

impl Delimiter {
    pub(crate) fn split<'a>(&'a self, s: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        match self {
            Delimiter::Whitespace => Box::new(s.split_whitespace()),
            Delimiter::Str(sep) => Box::new(s.split(sep.as_str()).filter(|t| !t.is_empty())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StageOp {
    Source,
    Project(Vec<(String, Expr)>),
    Filter(Expr),
    Explode {
        column: String,
        delimiter: Delimiter,
    },
    JoinStatic {
        table: StaticTableHandle,
        stream_key: String,
        join_type: JoinType,
    },
}

/// Resolved stage operation.
#[derive(Debug)]
pub(crate) enum PhysicalOp {
    Source,
    Project(Vec<PhysicalExpr>),
    Filter(PhysicalExpr),
    Explode {
        column: usize,
        delimiter: Delimiter,
    },
    JoinStatic {
        table: StaticTableHandle,
        stream_key: usize,
        join_type: JoinType,
    },
}

#[derive(Debug)]
pub(crate) struct Stage {
    pub(crate) input: Option<StageId>,
    op: StageOp,
    pub(crate) physical: PhysicalOp,
    pub(crate) schema: SchemaRef,
}

/// One aggregate column of an [`AggregateSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateExpr {
    function: AggregateFunction,
    column: Option<String>,
    alias: Option<String>,
}

impl AggregateExpr {
    fn new(function: AggregateFunction, column: Option<String>) -> Self {
        Self {
            function,
            column,
            alias: None,
        }
    }

    /// Names the result column.
    #[must_use]
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.alias = Some(name.into());
        self
    }

    /// Aggregate function.
    #[must_use]
    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    /// Result column name: the alias, or `function(column)`.
    #[must_use]
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.column) {
            (Some(alias), _) => alias.clone(),
            (None, Some(column)) => format!("{}({column})", self.function.name()),
            (None, None) => "count".to_string(),
        }
    }
}

/// `count(*)`
#[must_use]
pub fn count() -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::CountAll, None)
}

/// `count(column)`, ignoring nulls.
#[must_use]
pub fn count_col(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Count, Some(column.into()))
}

/// `sum(column)`
#[must_use]
pub fn sum(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Sum, Some(column.into()))
}

/// `min(column)`
#[must_use]
pub fn min(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Min, Some(column.into()))
}

/// `max(column)`
#[must_use]
pub fn max(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Max, Some(column.into()))
}

/// `avg(column)`
#[must_use]
pub fn avg(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Avg, Some(column.into()))
}

/// `first(column)`: value from the earliest source position.
#[must_use]
pub fn first(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::First, Some(column.into()))
}

/// `last(column)`: value from the latest source position.
#[must_use]
pub fn last(column: impl Into<String>) -> AggregateExpr {
    AggregateExpr::new(AggregateFunction::Last, Some(column.into()))
}

/// Tumbling event-time window with a watermark.
///
/// The watermark trails the largest event time seen by `allowed_lateness`.
/// A window is final once its end is at or behind the watermark; rows that
/// fall into a final window are dropped as late.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Window {
    time_column: String,
    size: Duration,
    allowed_lateness: Duration,
}

impl Window {
    /// Fixed-size, non-overlapping windows over `time_column`.
    #[must_use]
    pub fn tumbling(time_column: impl Into<String>, size: Duration) -> Self {
        Self {
            time_column: time_column.into(),
            size,
            allowed_lateness: Duration::ZERO,
        }
    }

    /// Sets how far behind the latest event time rows may still arrive.
    #[must_use]
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }
}

/// Grouping, aggregates and optional window of an aggregated output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AggregateSpec {
    group_by: Vec<String>,
    aggregates: Vec<AggregateExpr>,
    window: Option<Window>,
}

impl AggregateSpec {
    /// Empty spec: no groups, no aggregates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a grouping column.
    #[must_use]
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    /// Adds an aggregate column.
    #[must_use]
    pub fn aggregate(mut self, expr: AggregateExpr) -> Self {
        self.aggregates.push(expr);
        self
    }

    /// Groups additionally by a tumbling event-time window.
    #[must_use]
    pub fn window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}

#[derive(Debug)]
pub(crate) struct WindowPlan {
    pub(crate) time_index: usize,
    pub(crate) size_ms: i64,
    pub(crate) lateness_ms: i64,
}

impl WindowPlan {
    pub(crate) fn start_of(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.size_ms)
    }

    pub(crate) fn end_of(&self, start: i64) -> i64 {
        start.saturating_add(self.size_ms)
    }
}

#[derive(Debug)]
pub(crate) struct AggregatePlan {
    pub(crate) group_indices: Vec<usize>,
    pub(crate) inputs: Vec<Option<usize>>,
    pub(crate) functions: Vec<(AggregateFunction, Option<DataType>)>,
    pub(crate) window: Option<WindowPlan>,
}

/// A named result of the pipeline.
#[derive(Debug)]
pub struct Output {
    name: String,
    stage: StageId,
    mode: OutputMode,
    schema: SchemaRef,
    pub(crate) aggregation: Option<AggregatePlan>,
}

impl Output {
    /// Output name, unique within the pipeline.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage whose rows feed the output.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Output mode.
    #[must_use]
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Schema of the emitted rows.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// True if the output keeps aggregate state.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.aggregation.is_some()
    }

    /// True if the output aggregates over event-time windows.
    #[must_use]
    pub fn is_windowed(&self) -> bool {
        self.aggregation
            .as_ref()
            .is_some_and(|a| a.window.is_some())
    }
}

/// Builds an immutable [`Pipeline`].
#[derive(Debug)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    outputs: Vec<Output>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Starts a pipeline over a source with the given schema.
    #[must_use]
    pub fn new(source_schema: SchemaRef) -> Self {
        Self {
            stages: vec![Stage {
                input: None,
                op: StageOp::Source,
                physical: PhysicalOp::Source,
                schema: source_schema,
            }],
            outputs: Vec::new(),
            config: PipelineConfig::default(),
        }
    }

    /// Sets execution tuning.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// The source stage.
    #[must_use]
    pub fn source(&self) -> StageId {
        StageId(0)
    }

    /// Schema of a stage's rows.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownStage`] for ids from another builder.
    pub fn schema(&self, stage: StageId) -> Result<&SchemaRef, PlanError> {
        self.stage(stage).map(|s| &s.schema)
    }

    /// Number of distinct stages, including the source.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn stage(&self, id: StageId) -> Result<&Stage, PlanError> {
        self.stages.get(id.0).ok_or(PlanError::UnknownStage(id.0))
    }

    fn push(
        &mut self,
        input: StageId,
        op: StageOp,
        resolve: impl FnOnce(&Schema) -> Result<(PhysicalOp, Schema), PlanError>,
    ) -> Result<StageId, PlanError> {
        let input_schema = Arc::clone(&self.stage(input)?.schema);
        if let Some(existing) = self
            .stages
            .iter()
            .position(|s| s.input == Some(input) && s.op == op)
        {
            return Ok(StageId(existing));
        }
        let (physical, schema) = resolve(&input_schema)?;
        self.stages.push(Stage {
            input: Some(input),
            op,
            physical,
            schema: Arc::new(schema),
        });
        Ok(StageId(self.stages.len() - 1))
    }

    /// Computes one output column per `(name, expression)`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if an expression does not resolve or two
    /// columns share a name.
    pub fn project<S: Into<String>>(
        &mut self,
        input: StageId,
        columns: Vec<(S, Expr)>,
    ) -> Result<StageId, PlanError> {
        let columns: Vec<(String, Expr)> =
            columns.into_iter().map(|(n, e)| (n.into(), e)).collect();
        let op = StageOp::Project(columns.clone());
        self.push(input, op, |schema| {
            let mut fields: Vec<Field> = Vec::with_capacity(columns.len());
            let mut exprs = Vec::with_capacity(columns.len());
            for (name, expr) in &columns {
                if fields.iter().any(|f| f.name() == name) {
                    return Err(PlanError::DuplicateField(name.clone()));
                }
                let physical = expr.resolve(schema)?;
                fields.push(Field::new(
                    name.clone(),
                    physical.data_type(),
                    physical.is_nullable(),
                ));
                exprs.push(physical);
            }
            Ok((PhysicalOp::Project(exprs), Schema::new(fields)))
        })
    }

    /// Keeps rows for which `predicate` is true. Null counts as false.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if the predicate is not a Boolean expression.
    pub fn filter(&mut self, input: StageId, predicate: Expr) -> Result<StageId, PlanError> {
        let op = StageOp::Filter(predicate.clone());
        self.push(input, op, |schema| {
            let physical = predicate.resolve(schema)?;
            if physical.data_type() != DataType::Boolean {
                return Err(PlanError::Type {
                    expr: predicate.to_string(),
                    message: "filter predicate must be Boolean".to_string(),
                });
            }
            Ok((PhysicalOp::Filter(physical), schema.clone()))
        })
    }

    /// Splits a `Utf8` column into tokens, emitting one row per non-empty
    /// token with the column replaced by the token. Null values emit no rows.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if the column is missing or not `Utf8`.
    pub fn explode(
        &mut self,
        input: StageId,
        column: &str,
        delimiter: Delimiter,
    ) -> Result<StageId, PlanError> {
        let op = StageOp::Explode {
            column: column.to_string(),
            delimiter: delimiter.clone(),
        };
        self.push(input, op, |schema| {
            let index = schema.index_of(column)?;
            let field = &schema.fields()[index];
            if field.data_type() != DataType::Utf8 {
                return Err(PlanError::Type {
                    expr: format!("explode({column})"),
                    message: format!("expected Utf8, got {}", field.data_type()),
                });
            }
            let mut fields = schema.fields().to_vec();
            fields[index] = field.with_nullable(false);
            Ok((
                PhysicalOp::Explode {
                    column: index,
                    delimiter,
                },
                Schema::new(fields),
            ))
        })
    }

    /// Joins each row with the rows of `table` whose key equals the row's
    /// `stream_key` value.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if the key is missing, the key types differ or
    /// a table column name collides with a stream column.
    pub fn join_static(
        &mut self,
        input: StageId,
        table: &StaticTableHandle,
        stream_key: &str,
        join_type: JoinType,
    ) -> Result<StageId, PlanError> {
        let op = StageOp::JoinStatic {
            table: table.clone(),
            stream_key: stream_key.to_string(),
            join_type,
        };
        self.push(input, op, |schema| {
            let snapshot = table.snapshot();
            let key_index = schema.index_of(stream_key)?;
            let stream_type = schema.fields()[key_index].data_type();
            let table_type = snapshot
                .schema()
                .field(snapshot.schema().index_of(snapshot.key_column())?)
                .map(Field::data_type);
            if table_type != Some(stream_type) {
                return Err(PlanError::Type {
                    expr: format!("{stream_key} = {}", snapshot.key_column()),
                    message: format!(
                        "join key types differ: {stream_type} vs {}",
                        table_type.map_or_else(|| "?".to_string(), |t| t.to_string())
                    ),
                });
            }
            let joined = snapshot.joined_schema(schema, join_type)?;
            Ok((
                PhysicalOp::JoinStatic {
                    table: table.clone(),
                    stream_key: key_index,
                    join_type,
                },
                joined,
            ))
        })
    }

    /// Declares an aggregated output over `input`.
    ///
    /// Result rows hold the group columns, then `window_start` and
    /// `window_end` when windowed, then one column per aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if a column does not resolve, an aggregate
    /// does not apply to its input type, or the mode is not valid for the
    /// aggregation (append needs a window).
    pub fn aggregate(
        &mut self,
        name: &str,
        input: StageId,
        spec: AggregateSpec,
        mode: OutputMode,
    ) -> Result<(), PlanError> {
        self.check_output_name(name)?;
        let invalid = |message: &str| PlanError::InvalidOutput {
            output: name.to_string(),
            message: message.to_string(),
        };
        if spec.aggregates.is_empty() {
            return Err(invalid("at least one aggregate is required"));
        }
        if mode == OutputMode::Append && spec.window.is_none() {
            return Err(invalid(
                "append mode needs a windowed aggregation so rows can be finalized",
            ));
        }

        let schema = Arc::clone(&self.stage(input)?.schema);
        let mut fields = Vec::new();

        let mut group_indices = Vec::with_capacity(spec.group_by.len());
        for column in &spec.group_by {
            let index = schema.index_of(column)?;
            group_indices.push(index);
            fields.push(schema.fields()[index].clone());
        }

        let window = match &spec.window {
            Some(window) => {
                let time_index = schema.index_of(&window.time_column)?;
                let time_type = schema.fields()[time_index].data_type();
                if !matches!(time_type, DataType::Timestamp | DataType::Int64) {
                    return Err(invalid("window time column must be Timestamp or Int64"));
                }
                let size_ms = i64::try_from(window.size.as_millis()).unwrap_or(i64::MAX);
                if size_ms <= 0 {
                    return Err(invalid("window size must be at least one millisecond"));
                }
                fields.push(Field::new("window_start", DataType::Timestamp, false));
                fields.push(Field::new("window_end", DataType::Timestamp, false));
                Some(WindowPlan {
                    time_index,
                    size_ms,
                    lateness_ms: i64::try_from(window.allowed_lateness.as_millis())
                        .unwrap_or(i64::MAX),
                })
            }
            None => None,
        };

        let mut inputs = Vec::with_capacity(spec.aggregates.len());
        let mut functions = Vec::with_capacity(spec.aggregates.len());
        for agg in &spec.aggregates {
            let (index, input_type) = match &agg.column {
                Some(column) => {
                    let index = schema.index_of(column)?;
                    (Some(index), Some(schema.fields()[index].data_type()))
                }
                None => (None, None),
            };
            let output_type = agg.function.output_type(input_type).ok_or_else(|| {
                PlanError::Type {
                    expr: agg.output_name(),
                    message: format!(
                        "{} does not apply to {}",
                        agg.function.name(),
                        input_type.map_or_else(|| "*".to_string(), |t| t.to_string())
                    ),
                }
            })?;
            fields.push(Field::new(
                agg.output_name(),
                output_type,
                agg.function.output_nullable(),
            ));
            inputs.push(index);
            functions.push((agg.function, input_type));
        }

        let result_schema = Schema::new(fields);
        check_unique_fields(&result_schema)?;

        self.outputs.push(Output {
            name: name.to_string(),
            stage: input,
            mode,
            schema: Arc::new(result_schema),
            aggregation: Some(AggregatePlan {
                group_indices,
                inputs,
                functions,
                window,
            }),
        });
        Ok(())
    }

    /// Declares a stateless output emitting every row of `input`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidOutput`] for complete mode, which needs
    /// an aggregation.
    pub fn output(&mut self, name: &str, input: StageId, mode: OutputMode) -> Result<(), PlanError> {
        self.check_output_name(name)?;
        if mode == OutputMode::Complete {
            return Err(PlanError::InvalidOutput {
                output: name.to_string(),
                message: "complete mode requires an aggregation".to_string(),
            });
        }
        let schema = Arc::clone(&self.stage(input)?.schema);
        self.outputs.push(Output {
            name: name.to_string(),
            stage: input,
            mode,
            schema,
            aggregation: None,
        });
        Ok(())
    }

    fn check_output_name(&self, name: &str) -> Result<(), PlanError> {
        if self.outputs.iter().any(|o| o.name == name) {
            return Err(PlanError::DuplicateOutput(name.to_string()));
        }
        if self.outputs.len() >= usize::from(u16::MAX) {
            return Err(PlanError::InvalidOutput {
                output: name.to_string(),
                message: "too many outputs".to_string(),
            });
        }
        Ok(())
    }

    /// Finishes the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::NoOutputs`] if no output was declared.
    pub fn build(self) -> Result<Pipeline, PlanError> {
        if self.outputs.is_empty() {
            return Err(PlanError::NoOutputs);
        }
        Ok(Pipeline {
            stages: self.stages,
            outputs: self.outputs,
            config: self.config,
        })
    }
}

fn check_unique_fields(schema: &Schema) -> Result<(), PlanError> {
    for (i, field) in schema.fields().iter().enumerate() {
        if schema.fields()[..i].iter().any(|f| f.name() == field.name()) {
            return Err(PlanError::DuplicateField(field.name().to_string()));
        }
    }
    Ok(())
}

/// An immutable, validated pipeline graph.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) stages: Vec<Stage>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) config: PipelineConfig,
}

impl Pipeline {
    /// Schema records must have to enter the pipeline.
    #[must_use]
    pub fn source_schema(&self) -> &SchemaRef {
        &self.stages[0].schema
    }

    /// Declared outputs in declaration order.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Output by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Number of distinct stages, including the source.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Execution tuning.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stages some output depends on, in evaluation order.
    pub(crate) fn required_stages(&self) -> Vec<bool> {
        let mut needed = vec![false; self.stages.len()];
        for output in &self.outputs {
            let mut current = Some(output.stage);
            while let Some(id) = current {
                if needed[id.0] {
                    break;
                }
                needed[id.0] = true;
                current = self.stages[id.0].input;
            }
        }
        needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{col, lit, StaticTable};
    use crate::record;

    fn lines() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]))
    }

    fn orders() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("userid", DataType::Int64, false),
            Field::new("cost", DataType::Float64, false),
            Field::new("ts", DataType::Timestamp, false),
        ]))
    }

    #[test]
    fn test_shared_stages_are_deduplicated() {
        let mut b = PipelineBuilder::new(lines());
        let words = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
        let lower = b.project(words, vec![("word", col("value").lower())]).unwrap();

        let words_again = b.explode(b.source(), "value", Delimiter::Whitespace).unwrap();
        let lower_again = b
            .project(words_again, vec![("word", col("value").lower())])
            .unwrap();
        assert_eq!(words, words_again);
        assert_eq!(lower, lower_again);

        let upper = b.project(words, vec![("word", col("value").upper())]).unwrap();
        assert_ne!(upper, lower);
        assert_eq!(b.stage_count(), 4);
    }

    #[test]
    fn test_project_schema() {
        let mut b = PipelineBuilder::new(orders());
        let s = b
            .project(
                b.source(),
                vec![("id", col("userid")), ("double", col("cost") * lit(2.0))],
            )
            .unwrap();
        assert_eq!(
            b.schema(s).unwrap().to_string(),
            "(id: Int64, double: Float64)"
        );
        assert!(matches!(
            b.project(b.source(), vec![("a", col("userid")), ("a", col("cost"))]),
            Err(PlanError::DuplicateField(_))
        ));
    }

    #[test]
    fn test_filter_requires_boolean() {
        let mut b = PipelineBuilder::new(orders());
        assert!(b.filter(b.source(), col("cost").gt(lit(1.0))).is_ok());
        assert!(matches!(
            b.filter(b.source(), col("cost")),
            Err(PlanError::Type { .. })
        ));
    }

    #[test]
    fn test_explode_requires_utf8() {
        let mut b = PipelineBuilder::new(orders());
        assert!(matches!(
            b.explode(b.source(), "userid", Delimiter::Whitespace),
            Err(PlanError::Type { .. })
        ));
    }

    #[test]
    fn test_output_mode_validation() {
        let mut b = PipelineBuilder::new(orders());
        let src = b.source();
        let spec = AggregateSpec::new().group_by("userid").aggregate(sum("cost"));

        assert!(matches!(
            b.output("raw", src, OutputMode::Complete),
            Err(PlanError::InvalidOutput { .. })
        ));
        assert!(matches!(
            b.aggregate("totals", src, spec.clone(), OutputMode::Append),
            Err(PlanError::InvalidOutput { .. })
        ));

        b.aggregate("totals", src, spec.clone(), OutputMode::Update)
            .unwrap();
        b.aggregate(
            "windowed",
            src,
            spec.clone()
                .window(Window::tumbling("ts", Duration::from_secs(60))),
            OutputMode::Append,
        )
        .unwrap();
        b.output("raw", src, OutputMode::Append).unwrap();
        assert!(matches!(
            b.aggregate("totals", src, spec, OutputMode::Complete),
            Err(PlanError::DuplicateOutput(_))
        ));

        let pipeline = b.build().unwrap();
        let windowed = pipeline.output("windowed").unwrap();
        assert!(windowed.is_windowed());
        assert_eq!(
            windowed.schema().to_string(),
            "(userid: Int64, window_start: Timestamp, window_end: Timestamp, sum(cost): Float64?)"
        );
        assert!(!pipeline.output("raw").unwrap().is_aggregate());
    }

    #[test]
    fn test_aggregate_type_checks() {
        let mut b = PipelineBuilder::new(lines());
        let err = b
            .aggregate(
                "bad",
                b.source(),
                AggregateSpec::new().aggregate(sum("value")),
                OutputMode::Complete,
            )
            .unwrap_err();
        assert!(matches!(err, PlanError::Type { .. }));
    }

    #[test]
    fn test_join_static_schema_and_key_types() {
        let table_schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let handle = StaticTableHandle::new(
            StaticTable::new(table_schema, "id", vec![record!(1i64, "Ann")]).unwrap(),
        );

        let mut b = PipelineBuilder::new(orders());
        let joined = b
            .join_static(b.source(), &handle, "userid", JoinType::Left)
            .unwrap();
        assert_eq!(
            b.schema(joined).unwrap().to_string(),
            "(userid: Int64, cost: Float64, ts: Timestamp, name: Utf8?)"
        );
        let again = b
            .join_static(b.source(), &handle, "userid", JoinType::Left)
            .unwrap();
        assert_eq!(joined, again);

        assert!(matches!(
            b.join_static(b.source(), &handle, "cost", JoinType::Inner),
            Err(PlanError::Type { .. })
        ));
    }

    #[test]
    fn test_build_requires_outputs() {
        let b = PipelineBuilder::new(lines());
        assert!(matches!(b.build(), Err(PlanError::NoOutputs)));
    }

    #[test]
    fn test_required_stages() {
        let mut b = PipelineBuilder::new(orders());
        let unused = b.filter(b.source(), col("cost").gt(lit(0.0))).unwrap();
        let used = b.filter(b.source(), col("cost").lt(lit(0.0))).unwrap();
        b.output("neg", used, OutputMode::Append).unwrap();
        let pipeline = b.build().unwrap();
        let needed = pipeline.required_stages();
        assert!(needed[0]);
        assert!(!needed[unused.index()]);
        assert!(needed[used.index()]);
    }
}
