//! Typed schema descriptors.
//!
//! A [`Schema`] is an ordered list of named, typed fields. Streams declare
//! their schema once at construction; pipelines resolve field names to
//! indices when they are built so no string lookups happen per record.

use std::fmt;
use std::sync::Arc;

use crate::record::{Record, Value};

/// Shared, immutable schema handle.
pub type SchemaRef = Arc<Schema>;

/// Logical data types supported by records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 64-bit signed integer.
    Int64,
    /// 64-bit IEEE float.
    Float64,
    /// UTF-8 string.
    Utf8,
    /// Boolean.
    Boolean,
    /// Milliseconds since the Unix epoch.
    Timestamp,
}

impl DataType {
    /// Returns true for `Int64` and `Float64`.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }

    /// Converts to the equivalent Arrow type.
    #[must_use]
    pub fn to_arrow(self) -> arrow_schema::DataType {
        match self {
            DataType::Int64 => arrow_schema::DataType::Int64,
            DataType::Float64 => arrow_schema::DataType::Float64,
            DataType::Utf8 => arrow_schema::DataType::Utf8,
            DataType::Boolean => arrow_schema::DataType::Boolean,
            DataType::Timestamp => {
                arrow_schema::DataType::Timestamp(arrow_schema::TimeUnit::Millisecond, None)
            }
        }
    }

    /// Converts from an Arrow type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedType`] for Arrow types with no
    /// equivalent.
    pub fn from_arrow(data_type: &arrow_schema::DataType) -> Result<Self, SchemaError> {
        match data_type {
            arrow_schema::DataType::Int64 => Ok(DataType::Int64),
            arrow_schema::DataType::Float64 => Ok(DataType::Float64),
            arrow_schema::DataType::Utf8 => Ok(DataType::Utf8),
            arrow_schema::DataType::Boolean => Ok(DataType::Boolean),
            arrow_schema::DataType::Timestamp(arrow_schema::TimeUnit::Millisecond, _) => {
                Ok(DataType::Timestamp)
            }
            other => Err(SchemaError::UnsupportedType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::Utf8 => "Utf8",
            DataType::Boolean => "Boolean",
            DataType::Timestamp => "Timestamp",
        };
        f.write_str(name)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    /// Creates a new field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Whether the field accepts nulls.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Returns a copy of this field with a different nullability.
    #[must_use]
    pub fn with_nullable(&self, nullable: bool) -> Self {
        Self {
            nullable,
            ..self.clone()
        }
    }
}

/// Ordered list of fields describing a record layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema from fields.
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field at `index`.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Resolves a field name to its index.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::FieldNotFound`] if no field has that name.
    pub fn index_of(&self, name: &str) -> Result<usize, SchemaError> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| SchemaError::FieldNotFound(name.to_string()))
    }

    /// Checks that `record` matches this schema exactly.
    ///
    /// Values are never coerced: an `Int64` column rejects a `Float64` value.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::FieldCount`], [`SchemaError::TypeMismatch`] or
    /// [`SchemaError::NullViolation`].
    pub fn validate(&self, record: &Record) -> Result<(), SchemaError> {
        if record.len() != self.fields.len() {
            return Err(SchemaError::FieldCount {
                expected: self.fields.len(),
                actual: record.len(),
            });
        }
        for (field, value) in self.fields.iter().zip(record.values()) {
            match value.data_type() {
                None if field.nullable => {}
                None => return Err(SchemaError::NullViolation(field.name.clone())),
                Some(actual) if actual == field.data_type => {}
                Some(actual) => {
                    return Err(SchemaError::TypeMismatch {
                        field: field.name.clone(),
                        expected: field.data_type,
                        actual,
                    })
                }
            }
        }
        Ok(())
    }

    /// Converts to an Arrow schema.
    #[must_use]
    pub fn to_arrow(&self) -> arrow_schema::Schema {
        arrow_schema::Schema::new(
            self.fields
                .iter()
                .map(|f| arrow_schema::Field::new(&f.name, f.data_type.to_arrow(), f.nullable))
                .collect::<Vec<_>>(),
        )
    }

    /// Converts from an Arrow schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedType`] if any column type has no
    /// equivalent.
    pub fn from_arrow(schema: &arrow_schema::Schema) -> Result<Self, SchemaError> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(Field::new(
                    f.name(),
                    DataType::from_arrow(f.data_type())?,
                    f.is_nullable(),
                ))
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        Ok(Self::new(fields))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field.name, field.data_type)?;
            if field.nullable {
                f.write_str("?")?;
            }
        }
        f.write_str(")")
    }
}

/// Errors raised when records or schemas disagree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// No field with the given name.
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// Record has the wrong number of fields.
    #[error("expected {expected} fields, got {actual}")]
    FieldCount {
        /// Declared field count.
        expected: usize,
        /// Field count of the record.
        actual: usize,
    },

    /// Value type differs from the declared type.
    #[error("field '{field}' expected {expected}, got {actual}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared type.
        expected: DataType,
        /// Type of the offending value.
        actual: DataType,
    },

    /// Null in a non-nullable field.
    #[error("field '{0}' is not nullable")]
    NullViolation(String),

    /// Type with no Rill equivalent.
    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    /// Arrow conversion failure.
    #[error("arrow error: {0}")]
    Arrow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Schema {
        Schema::new(vec![
            Field::new("userid", DataType::Int64, false),
            Field::new("cost", DataType::Float64, true),
        ])
    }

    #[test]
    fn test_index_of() {
        let schema = orders();
        assert_eq!(schema.index_of("cost").unwrap(), 1);
        assert!(matches!(
            schema.index_of("missing"),
            Err(SchemaError::FieldNotFound(_))
        ));
    }

    #[test]
    fn test_validate_accepts_matching_record() {
        let schema = orders();
        schema
            .validate(&Record::new(vec![Value::Int64(1), Value::Float64(5.0)]))
            .unwrap();
        schema
            .validate(&Record::new(vec![Value::Int64(1), Value::Null]))
            .unwrap();
    }

    #[test]
    fn test_validate_rejects_without_coercion() {
        let schema = orders();
        let err = schema
            .validate(&Record::new(vec![Value::Float64(1.0), Value::Float64(5.0)]))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));

        let err = schema
            .validate(&Record::new(vec![Value::Int64(1)]))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::FieldCount {
                expected: 2,
                actual: 1
            }
        );

        let err = schema
            .validate(&Record::new(vec![Value::Null, Value::Float64(5.0)]))
            .unwrap_err();
        assert_eq!(err, SchemaError::NullViolation("userid".into()));
    }

    #[test]
    fn test_arrow_round_trip() {
        let schema = orders();
        let arrow = schema.to_arrow();
        assert_eq!(arrow.fields().len(), 2);
        assert_eq!(Schema::from_arrow(&arrow).unwrap(), schema);
    }

    #[test]
    fn test_display() {
        assert_eq!(orders().to_string(), "(userid: Int64, cost: Float64?)");
    }
}
