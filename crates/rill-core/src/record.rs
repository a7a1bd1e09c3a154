//! Values, records and offsets.
//!
//! [`Value`] has total equality, ordering and hashing (floats use the IEEE
//! total order) so any tuple of values can serve as a group key.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder,
};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMillisecondType};
use arrow_array::{Array, ArrayRef, RecordBatch};

use crate::schema::{DataType, Schema, SchemaError};

/// Position of a record in its source. `0` means "nothing consumed yet";
/// the first record of a source has offset `1`.
pub type Offset = u64;

mod value_types {
    #![allow(missing_docs)] // rkyv derive output

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// A single typed value.
    #[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum Value {
        /// Missing value.
        Null,
        /// 64-bit signed integer.
        Int64(i64),
        /// 64-bit float.
        Float64(f64),
        /// UTF-8 string.
        Utf8(String),
        /// Boolean.
        Boolean(bool),
        /// Milliseconds since the Unix epoch.
        Timestamp(i64),
    }
}

pub use value_types::Value;

impl Value {
    /// Type of this value, `None` for `Null`.
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// True for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// String payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload of `Int64` and `Timestamp` values.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Utf8(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int64(a), Value::Int64(b)) | (Value::Timestamp(a), Value::Timestamp(b)) => {
                a.cmp(b)
            }
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Utf8(a), Value::Utf8(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int64(v) | Value::Timestamp(v) => v.hash(state),
            // Bit patterns agree with `total_cmp` equality.
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(s) => s.hash(state),
            Value::Boolean(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int64(v) | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(s) => f.write_str(s),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An immutable row of values laid out according to a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    /// Creates a record from its values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Values in field order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at `index`, `Null` when out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the record has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the record, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Builds a [`Record`] from a list of expressions convertible to [`Value`].
#[macro_export]
macro_rules! record {
    ($($value:expr),* $(,)?) => {
        $crate::record::Record::new(vec![$($crate::record::Value::from($value)),*])
    };
}

/// Converts records to an Arrow `RecordBatch`.
///
/// # Errors
///
/// Returns [`SchemaError`] if a record does not match `schema` or Arrow
/// rejects the arrays.
pub fn records_to_arrow(schema: &Schema, records: &[Record]) -> Result<RecordBatch, SchemaError> {
    for record in records {
        schema.validate(record)?;
    }

    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| build_column(field.data_type(), idx, records))
        .collect::<Vec<ArrayRef>>();

    RecordBatch::try_new(Arc::new(schema.to_arrow()), columns)
        .map_err(|e| SchemaError::Arrow(e.to_string()))
}

fn build_column(data_type: DataType, idx: usize, records: &[Record]) -> ArrayRef {
    let values = records.iter().map(|r| r.get(idx));
    match data_type {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(records.len());
            values.for_each(|v| b.append_option(v.as_i64()));
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(records.len());
            values.for_each(|v| b.append_option(v.as_f64()));
            Arc::new(b.finish())
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            values.for_each(|v| b.append_option(v.as_str()));
            Arc::new(b.finish())
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(records.len());
            values.for_each(|v| b.append_option(v.as_bool()));
            Arc::new(b.finish())
        }
        DataType::Timestamp => {
            let mut b = TimestampMillisecondBuilder::with_capacity(records.len());
            values.for_each(|v| b.append_option(v.as_i64()));
            Arc::new(b.finish())
        }
    }
}

/// Converts an Arrow `RecordBatch` into records plus the equivalent schema.
///
/// # Errors
///
/// Returns [`SchemaError::UnsupportedType`] for columns with no Rill type.
pub fn records_from_arrow(batch: &RecordBatch) -> Result<(Schema, Vec<Record>), SchemaError> {
    let schema = Schema::from_arrow(batch.schema().as_ref())?;
    let mut rows: Vec<Vec<Value>> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(schema.len()))
        .collect();

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        for (row_idx, row) in rows.iter_mut().enumerate() {
            row.push(read_value(field.data_type(), column.as_ref(), row_idx));
        }
    }

    Ok((schema, rows.into_iter().map(Record::new).collect()))
}

fn read_value(data_type: DataType, array: &dyn Array, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match data_type {
        DataType::Int64 => Value::Int64(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => Value::Float64(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::Utf8(array.as_string::<i32>().value(row).to_string()),
        DataType::Boolean => Value::Boolean(array.as_boolean().value(row)),
        DataType::Timestamp => {
            Value::Timestamp(array.as_primitive::<TimestampMillisecondType>().value(row))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::{BTreeSet, HashSet};

    fn hash_of<T: Hash + ?Sized>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    /// Small domains so that equal keys come up often.
    fn value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            (-3i64..3).prop_map(Value::Int64),
            (-3i64..3).prop_map(Value::Timestamp),
            prop_oneof![
                Just(f64::NAN),
                Just(-f64::NAN),
                Just(0.0),
                Just(-0.0),
                Just(f64::INFINITY),
                (-3i32..3).prop_map(f64::from),
            ]
            .prop_map(Value::Float64),
            "[ab]{0,2}".prop_map(Value::Utf8),
            any::<bool>().prop_map(Value::Boolean),
        ]
    }

    fn group_key() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(value(), 0..3)
    }

    proptest! {
        #[test]
        fn group_key_eq_hash_and_order_agree(a in group_key(), b in group_key(), c in group_key()) {
            prop_assert_eq!(&a, &a.clone());
            prop_assert_eq!(hash_of(&a), hash_of(&a.clone()));
            if a == b {
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
            prop_assert_eq!(a == b, a.cmp(&b) == Ordering::Equal);
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn hashed_and_sorted_grouping_agree(keys in prop::collection::vec(group_key(), 0..30)) {
            let hashed: HashSet<&Vec<Value>> = keys.iter().collect();
            let sorted: BTreeSet<&Vec<Value>> = keys.iter().collect();
            prop_assert_eq!(hashed.len(), sorted.len());
        }
    }

    #[test]
    fn test_float_equality_is_total() {
        let nan = Value::Float64(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert_eq!(hash_of(&nan), hash_of(&nan.clone()));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
    }

    #[test]
    fn test_ordering_across_types() {
        let mut values = vec![
            Value::Utf8("a".into()),
            Value::Int64(3),
            Value::Null,
            Value::Int64(-1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Int64(-1),
                Value::Int64(3),
                Value::Utf8("a".into())
            ]
        );
    }

    #[test]
    fn test_record_macro() {
        let r = record!(1i64, "Ann", 5.0, Option::<i64>::None);
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(1), &Value::Utf8("Ann".into()));
        assert!(r.get(3).is_null());
        assert!(r.get(10).is_null());
    }

    #[test]
    fn test_arrow_conversion() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("ts", DataType::Timestamp, false),
        ]);
        let records = vec![
            Record::new(vec![
                Value::Int64(1),
                Value::Utf8("Ann".into()),
                Value::Timestamp(1_000),
            ]),
            Record::new(vec![Value::Int64(2), Value::Null, Value::Timestamp(2_000)]),
        ];

        let batch = records_to_arrow(&schema, &records).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);

        let (back_schema, back) = records_from_arrow(&batch).unwrap();
        assert_eq!(back_schema, schema);
        assert_eq!(back, records);
    }

    #[test]
    fn test_arrow_conversion_rejects_bad_rows() {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let err = records_to_arrow(&schema, &[record!("x")]).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }
}
