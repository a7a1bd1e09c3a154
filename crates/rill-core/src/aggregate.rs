//! Aggregate accumulators.
//!
//! Every accumulator supports `update` (fold one input value) and `merge`
//! (combine two partial states). Both are associative and commutative, so a
//! batch can be split across workers and the partial states combined in any
//! order. `first` and `last` are made order independent by tagging each
//! value with its [`Position`] in the source and keeping the smallest or
//! largest tag.

use crate::record::{Offset, Value};
use crate::schema::DataType;

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// `count(*)`: number of rows.
    CountAll,
    /// `count(col)`: number of non-null values.
    Count,
    /// Sum of non-null values. Integer sums wrap on overflow.
    Sum,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Arithmetic mean of non-null values, as `Float64`.
    Avg,
    /// Non-null value with the lowest source position.
    First,
    /// Non-null value with the highest source position.
    Last,
}

impl AggregateFunction {
    /// Result type for an input of type `input`, or `None` if the function
    /// cannot be applied to it.
    #[must_use]
    pub fn output_type(self, input: Option<DataType>) -> Option<DataType> {
        match (self, input) {
            (AggregateFunction::CountAll | AggregateFunction::Count, _) => Some(DataType::Int64),
            (AggregateFunction::Sum, Some(t)) if t.is_numeric() => Some(t),
            (AggregateFunction::Avg, Some(t)) if t.is_numeric() => Some(DataType::Float64),
            (
                AggregateFunction::Min
                | AggregateFunction::Max
                | AggregateFunction::First
                | AggregateFunction::Last,
                Some(t),
            ) => Some(t),
            _ => None,
        }
    }

    /// Whether the result can be null (empty groups or all-null inputs).
    #[must_use]
    pub fn output_nullable(self) -> bool {
        !matches!(self, AggregateFunction::CountAll | AggregateFunction::Count)
    }

    /// Lower-case function name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::CountAll | AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
        }
    }
}

mod archived {
    #![allow(missing_docs)] // rkyv derive output

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    use crate::record::Value;

    /// Where a row came from: source offset, then its index among the rows
    /// derived from that source record.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Default,
        Archive,
        RkyvSerialize,
        RkyvDeserialize,
    )]
    pub struct Position {
        pub offset: u64,
        pub seq: u32,
    }

    /// A value tagged with its position.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct Tagged {
        pub position: Position,
        pub value: Value,
    }

    /// Partial aggregate for one function.
    #[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum Accumulator {
        CountAll(i64),
        Count(i64),
        SumInt(Option<i64>),
        SumFloat(Option<f64>),
        Min(Option<Value>),
        Max(Option<Value>),
        Avg { sum: f64, count: i64 },
        First(Option<Tagged>),
        Last(Option<Tagged>),
    }

    /// All accumulators of one group, in aggregate-expression order.
    #[derive(Debug, Clone, PartialEq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct AggregateState {
        pub accumulators: Vec<Accumulator>,
    }
}

pub use archived::{Accumulator, AggregateState, Position, Tagged};

impl Position {
    /// Creates a position.
    #[must_use]
    pub fn new(offset: Offset, seq: u32) -> Self {
        Self { offset, seq }
    }
}

impl Accumulator {
    /// Creates an empty accumulator for `function` over values of `input`.
    #[must_use]
    pub fn new(function: AggregateFunction, input: Option<DataType>) -> Self {
        match function {
            AggregateFunction::CountAll => Accumulator::CountAll(0),
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum if input == Some(DataType::Float64) => {
                Accumulator::SumFloat(None)
            }
            AggregateFunction::Sum => Accumulator::SumInt(None),
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
            AggregateFunction::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateFunction::First => Accumulator::First(None),
            AggregateFunction::Last => Accumulator::Last(None),
        }
    }

    /// Folds one input value into the accumulator.
    pub fn update(&mut self, value: &Value, position: Position) {
        match self {
            Accumulator::CountAll(n) => *n += 1,
            _ if value.is_null() => {}
            Accumulator::Count(n) => *n += 1,
            Accumulator::SumInt(sum) => {
                if let Some(v) = value.as_i64() {
                    *sum = Some(sum.unwrap_or(0).wrapping_add(v));
                }
            }
            Accumulator::SumFloat(sum) => {
                if let Some(v) = value.as_f64() {
                    *sum = Some(sum.unwrap_or(0.0) + v);
                }
            }
            Accumulator::Min(current) => keep_if(current, value, |new, old| new < old),
            Accumulator::Max(current) => keep_if(current, value, |new, old| new > old),
            Accumulator::Avg { sum, count } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            Accumulator::First(current) => keep_tagged(
                current,
                Tagged {
                    position,
                    value: value.clone(),
                },
                |new, old| new < old,
            ),
            Accumulator::Last(current) => keep_tagged(
                current,
                Tagged {
                    position,
                    value: value.clone(),
                },
                |new, old| new > old,
            ),
        }
    }

    /// Combines another partial state for the same function into this one.
    pub fn merge(&mut self, other: &Accumulator) {
        match (self, other) {
            (Accumulator::CountAll(a), Accumulator::CountAll(b))
            | (Accumulator::Count(a), Accumulator::Count(b)) => *a += *b,
            (Accumulator::SumInt(a), Accumulator::SumInt(b)) => {
                if let Some(b) = b {
                    *a = Some(a.unwrap_or(0).wrapping_add(*b));
                }
            }
            (Accumulator::SumFloat(a), Accumulator::SumFloat(b)) => {
                if let Some(b) = b {
                    *a = Some(a.unwrap_or(0.0) + *b);
                }
            }
            (Accumulator::Min(a), Accumulator::Min(Some(b))) => {
                keep_if(a, b, |new, old| new < old);
            }
            (Accumulator::Max(a), Accumulator::Max(Some(b))) => {
                keep_if(a, b, |new, old| new > old);
            }
            (
                Accumulator::Avg { sum, count },
                Accumulator::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += *other_sum;
                *count += *other_count;
            }
            (Accumulator::First(a), Accumulator::First(Some(b))) => {
                keep_tagged(a, b.clone(), |new, old| new < old);
            }
            (Accumulator::Last(a), Accumulator::Last(Some(b))) => {
                keep_tagged(a, b.clone(), |new, old| new > old);
            }
            _ => {}
        }
    }

    /// Final value of the accumulator.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn finish(&self) -> Value {
        match self {
            Accumulator::CountAll(n) | Accumulator::Count(n) => Value::Int64(*n),
            Accumulator::SumInt(sum) => sum.map_or(Value::Null, Value::Int64),
            Accumulator::SumFloat(sum) => sum.map_or(Value::Null, Value::Float64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone().unwrap_or(Value::Null),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { sum, count } => Value::Float64(sum / *count as f64),
            Accumulator::First(t) | Accumulator::Last(t) => {
                t.as_ref().map_or(Value::Null, |t| t.value.clone())
            }
        }
    }
}

fn keep_if(current: &mut Option<Value>, candidate: &Value, better: impl Fn(&Value, &Value) -> bool) {
    match current {
        Some(old) if !better(candidate, old) => {}
        _ => *current = Some(candidate.clone()),
    }
}

fn keep_tagged(
    current: &mut Option<Tagged>,
    candidate: Tagged,
    better: impl Fn(&Position, &Position) -> bool,
) {
    match current {
        Some(old) if !better(&candidate.position, &old.position) => {}
        _ => *current = Some(candidate),
    }
}

impl AggregateState {
    /// Creates empty accumulators for `(function, input type)` pairs.
    #[must_use]
    pub fn new(functions: &[(AggregateFunction, Option<DataType>)]) -> Self {
        Self {
            accumulators: functions
                .iter()
                .map(|(f, t)| Accumulator::new(*f, *t))
                .collect(),
        }
    }

    /// Folds one row's aggregate inputs, one value per accumulator.
    pub fn update(&mut self, inputs: &[Value], position: Position) {
        for (acc, value) in self.accumulators.iter_mut().zip(inputs) {
            acc.update(value, position);
        }
    }

    /// Merges another partial state of the same shape.
    pub fn merge(&mut self, other: &AggregateState) {
        for (acc, other) in self.accumulators.iter_mut().zip(&other.accumulators) {
            acc.merge(other);
        }
    }

    /// Final values, one per accumulator.
    #[must_use]
    pub fn finish(&self) -> Vec<Value> {
        self.accumulators.iter().map(Accumulator::finish).collect()
    }
}
