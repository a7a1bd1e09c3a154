//! Expression language.
//!
//! [`Expr`] is the logical, name-based form built by callers. It is resolved
//! once against a schema into a [`PhysicalExpr`] that reads columns by index
//! and carries its result type.
//!
//! Nulls propagate through comparisons, arithmetic and string functions.
//! `AND`/`OR` use three-valued logic. Division by zero yields null; integer
//! overflow is an evaluation error.

use std::cmp::Ordering;
use std::fmt;
use std::ops;

use super::{ExecError, PlanError};
use crate::record::{Record, Value};
use crate::schema::{DataType, Schema};

/// Comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
}

impl BinaryOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// Single-argument string functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringFunc {
    /// Lower-case.
    Lower,
    /// Upper-case.
    Upper,
    /// Strip leading and trailing whitespace.
    Trim,
    /// Number of characters, as `Int64`.
    Length,
}

impl StringFunc {
    fn name(self) -> &'static str {
        match self {
            StringFunc::Lower => "lower",
            StringFunc::Upper => "upper",
            StringFunc::Trim => "trim",
            StringFunc::Length => "length",
        }
    }
}

/// A logical expression over named columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Column reference by name.
    Column(String),
    /// Constant.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Boolean negation.
    Not(Box<Expr>),
    /// `IS NULL`
    IsNull(Box<Expr>),
    /// `IS NOT NULL`
    IsNotNull(Box<Expr>),
    /// String function application.
    Func {
        /// Function.
        func: StringFunc,
        /// Argument.
        arg: Box<Expr>,
    },
}

/// Column reference.
#[must_use]
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

/// Literal value.
#[must_use]
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

impl Expr {
    fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    fn func(self, func: StringFunc) -> Expr {
        Expr::Func {
            func,
            arg: Box::new(self),
        }
    }

    /// `self = other`
    #[must_use]
    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    /// `self != other`
    #[must_use]
    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::NotEq, other)
    }

    /// `self < other`
    #[must_use]
    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    /// `self <= other`
    #[must_use]
    pub fn lt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::LtEq, other)
    }

    /// `self > other`
    #[must_use]
    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    /// `self >= other`
    #[must_use]
    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GtEq, other)
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Expr) -> Expr {
        self.binary(BinaryOp::And, other)
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Or, other)
    }

    /// `self IS NULL`
    #[must_use]
    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    /// `self IS NOT NULL`
    #[must_use]
    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(Box::new(self))
    }

    /// `lower(self)`
    #[must_use]
    pub fn lower(self) -> Expr {
        self.func(StringFunc::Lower)
    }

    /// `upper(self)`
    #[must_use]
    pub fn upper(self) -> Expr {
        self.func(StringFunc::Upper)
    }

    /// `trim(self)`
    #[must_use]
    pub fn trim(self) -> Expr {
        self.func(StringFunc::Trim)
    }

    /// `length(self)`
    #[must_use]
    pub fn length(self) -> Expr {
        self.func(StringFunc::Length)
    }

    /// Resolves column names against `schema` and type-checks the tree.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] for unknown columns or ill-typed operations.
    pub fn resolve(&self, schema: &Schema) -> Result<PhysicalExpr, PlanError> {
        match self {
            Expr::Column(name) => {
                let index = schema.index_of(name)?;
                let field = &schema.fields()[index];
                Ok(PhysicalExpr {
                    kind: Kind::Column(index),
                    data_type: field.data_type(),
                    nullable: field.is_nullable(),
                })
            }
            Expr::Literal(value) => {
                let data_type = value.data_type().ok_or_else(|| self.type_error("untyped null literal"))?;
                Ok(PhysicalExpr {
                    kind: Kind::Literal(value.clone()),
                    data_type,
                    nullable: false,
                })
            }
            Expr::Binary { op, left, right } => {
                let left = left.resolve(schema)?;
                let right = right.resolve(schema)?;
                let data_type = self.binary_type(*op, left.data_type, right.data_type)?;
                Ok(PhysicalExpr {
                    // Division by zero yields null.
                    nullable: left.nullable || right.nullable || *op == BinaryOp::Divide,
                    data_type,
                    kind: Kind::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                })
            }
            Expr::Not(inner) => {
                let inner = inner.resolve(schema)?;
                if inner.data_type != DataType::Boolean {
                    return Err(self.type_error("NOT requires a Boolean operand"));
                }
                Ok(PhysicalExpr {
                    nullable: inner.nullable,
                    data_type: DataType::Boolean,
                    kind: Kind::Not(Box::new(inner)),
                })
            }
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
                let inner = inner.resolve(schema)?;
                let negated = matches!(self, Expr::IsNotNull(_));
                Ok(PhysicalExpr {
                    nullable: false,
                    data_type: DataType::Boolean,
                    kind: Kind::IsNull {
                        inner: Box::new(inner),
                        negated,
                    },
                })
            }
            Expr::Func { func, arg } => {
                let arg = arg.resolve(schema)?;
                if arg.data_type != DataType::Utf8 {
                    return Err(self.type_error(&format!(
                        "{} requires a Utf8 argument, got {}",
                        func.name(),
                        arg.data_type
                    )));
                }
                let data_type = if *func == StringFunc::Length {
                    DataType::Int64
                } else {
                    DataType::Utf8
                };
                Ok(PhysicalExpr {
                    nullable: arg.nullable,
                    data_type,
                    kind: Kind::Func {
                        func: *func,
                        arg: Box::new(arg),
                    },
                })
            }
        }
    }

    fn binary_type(&self, op: BinaryOp, l: DataType, r: DataType) -> Result<DataType, PlanError> {
        if op.is_comparison() {
            if l == r || (l.is_numeric() && r.is_numeric()) {
                return Ok(DataType::Boolean);
            }
            return Err(self.type_error(&format!("cannot compare {l} with {r}")));
        }
        if op.is_arithmetic() {
            return match (l, r) {
                (DataType::Int64, DataType::Int64) => Ok(DataType::Int64),
                _ if l.is_numeric() && r.is_numeric() => Ok(DataType::Float64),
                _ => Err(self.type_error(&format!("arithmetic on {l} and {r}"))),
            };
        }
        if l == DataType::Boolean && r == DataType::Boolean {
            Ok(DataType::Boolean)
        } else {
            Err(self.type_error(&format!("{} requires Boolean operands", op.symbol())))
        }
    }

    fn type_error(&self, message: &str) -> PlanError {
        PlanError::Type {
            expr: self.to_string(),
            message: message.to_string(),
        }
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Plus, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Minus, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Multiply, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Divide, rhs)
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => f.write_str(name),
            Expr::Literal(Value::Utf8(s)) => write!(f, "'{s}'"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Not(inner) => write!(f, "NOT {inner}"),
            Expr::IsNull(inner) => write!(f, "{inner} IS NULL"),
            Expr::IsNotNull(inner) => write!(f, "{inner} IS NOT NULL"),
            Expr::Func { func, arg } => write!(f, "{}({arg})", func.name()),
        }
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<PhysicalExpr>,
        right: Box<PhysicalExpr>,
    },
    Not(Box<PhysicalExpr>),
    IsNull {
        inner: Box<PhysicalExpr>,
        negated: bool,
    },
    Func {
        func: StringFunc,
        arg: Box<PhysicalExpr>,
    },
}

/// A type-checked expression reading columns by index.
#[derive(Debug, Clone)]
pub struct PhysicalExpr {
    kind: Kind,
    data_type: DataType,
    nullable: bool,
}

impl PhysicalExpr {
    /// Result type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Whether evaluation can produce null.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Evaluates against one record.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Overflow`] on integer overflow.
    pub fn evaluate(&self, record: &Record) -> Result<Value, ExecError> {
        match &self.kind {
            Kind::Column(index) => Ok(record.get(*index).clone()),
            Kind::Literal(value) => Ok(value.clone()),
            Kind::Binary { op, left, right } => {
                let l = left.evaluate(record)?;
                match op {
                    BinaryOp::And | BinaryOp::Or => {
                        let r = right.evaluate(record)?;
                        Ok(logical(*op, l.as_bool(), r.as_bool()))
                    }
                    _ if l.is_null() => Ok(Value::Null),
                    _ => {
                        let r = right.evaluate(record)?;
                        if r.is_null() {
                            Ok(Value::Null)
                        } else if op.is_comparison() {
                            Ok(Value::Boolean(compare(*op, &l, &r)))
                        } else {
                            arithmetic(*op, &l, &r)
                        }
                    }
                }
            }
            Kind::Not(inner) => Ok(match inner.evaluate(record)?.as_bool() {
                Some(b) => Value::Boolean(!b),
                None => Value::Null,
            }),
            Kind::IsNull { inner, negated } => {
                Ok(Value::Boolean(inner.evaluate(record)?.is_null() != *negated))
            }
            Kind::Func { func, arg } => {
                let value = arg.evaluate(record)?;
                let Some(s) = value.as_str() else {
                    return Ok(Value::Null);
                };
                Ok(match func {
                    StringFunc::Lower => Value::Utf8(s.to_lowercase()),
                    StringFunc::Upper => Value::Utf8(s.to_uppercase()),
                    StringFunc::Trim => Value::Utf8(s.trim().to_string()),
                    StringFunc::Length => {
                        Value::Int64(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))
                    }
                })
            }
        }
    }

    /// Evaluates a Boolean predicate; null counts as false.
    ///
    /// # Errors
    ///
    /// Propagates evaluation errors.
    pub fn matches(&self, record: &Record) -> Result<bool, ExecError> {
        Ok(self.evaluate(record)?.as_bool().unwrap_or(false))
    }
}

fn logical(op: BinaryOp, l: Option<bool>, r: Option<bool>) -> Value {
    let result = match (op, l, r) {
        (BinaryOp::And, Some(false), _) | (BinaryOp::And, _, Some(false)) => Some(false),
        (BinaryOp::And, Some(true), Some(true)) => Some(true),
        (BinaryOp::Or, Some(true), _) | (BinaryOp::Or, _, Some(true)) => Some(true),
        (BinaryOp::Or, Some(false), Some(false)) => Some(false),
        _ => None,
    };
    result.map_or(Value::Null, Value::Boolean)
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> bool {
    let ordering = match (l, r) {
        (Value::Int64(_), Value::Float64(_)) | (Value::Float64(_), Value::Int64(_)) => {
            let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            a.total_cmp(&b)
        }
        _ => l.cmp(r),
    };
    match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::NotEq => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::GtEq => ordering != Ordering::Less,
        _ => false,
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExecError> {
    if let (Value::Int64(a), Value::Int64(b)) = (l, r) {
        let result = match op {
            BinaryOp::Plus => a.checked_add(*b),
            BinaryOp::Minus => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            BinaryOp::Divide if *b == 0 => return Ok(Value::Null),
            _ => a.checked_div(*b),
        };
        return result
            .map(Value::Int64)
            .ok_or_else(|| ExecError::Overflow(format!("{a} {} {b}", op.symbol())));
    }

    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Ok(Value::Null);
    };
    Ok(match op {
        BinaryOp::Plus => Value::Float64(a + b),
        BinaryOp::Minus => Value::Float64(a - b),
        BinaryOp::Multiply => Value::Float64(a * b),
        _ if b == 0.0 => Value::Null,
        _ => Value::Float64(a / b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::schema::Field;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("cost", DataType::Float64, true),
            Field::new("name", DataType::Utf8, true),
            Field::new("active", DataType::Boolean, true),
        ])
    }

    fn eval(expr: &Expr, record: &Record) -> Value {
        expr.resolve(&schema()).unwrap().evaluate(record).unwrap()
    }

    #[test]
    fn test_arithmetic_and_types() {
        let row = record!(10i64, 2.5, "Ann", true);
        let e = col("id") * lit(2i64) + lit(1i64);
        assert_eq!(e.resolve(&schema()).unwrap().data_type(), DataType::Int64);
        assert_eq!(eval(&e, &row), Value::Int64(21));

        let mixed = col("id") + col("cost");
        assert_eq!(mixed.resolve(&schema()).unwrap().data_type(), DataType::Float64);
        assert_eq!(eval(&mixed, &row), Value::Float64(12.5));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let row = record!(10i64, 0.0, "Ann", true);
        assert!(eval(&(col("id") / lit(0i64)), &row).is_null());
        assert!(eval(&(col("id") / col("cost")), &row).is_null());
        assert_eq!(eval(&(col("id") / lit(3i64)), &row), Value::Int64(3));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let row = record!(i64::MAX, 0.0, "Ann", true);
        let expr = (col("id") + lit(1i64)).resolve(&schema()).unwrap();
        assert!(matches!(expr.evaluate(&row), Err(ExecError::Overflow(_))));
    }

    #[test]
    fn test_null_propagation_and_three_valued_logic() {
        let row = record!(1i64, Option::<f64>::None, Option::<&str>::None, Option::<bool>::None);
        assert!(eval(&col("cost").gt(lit(1.0)), &row).is_null());
        assert!(eval(&col("name").lower(), &row).is_null());
        assert_eq!(eval(&col("cost").is_null(), &row), Value::Boolean(true));
        assert_eq!(
            eval(&col("active").and(lit(false)), &row),
            Value::Boolean(false)
        );
        assert_eq!(eval(&col("active").or(lit(true)), &row), Value::Boolean(true));
        assert!(eval(&col("active").and(lit(true)), &row).is_null());
        assert!(eval(&!col("active"), &row).is_null());

        let predicate = col("cost").gt(lit(1.0)).resolve(&schema()).unwrap();
        assert!(!predicate.matches(&row).unwrap());
    }

    #[test]
    fn test_string_functions() {
        let row = record!(1i64, 1.0, "  Hello ", true);
        assert_eq!(eval(&col("name").trim().upper(), &row), Value::from("HELLO"));
        assert_eq!(eval(&col("name").length(), &row), Value::Int64(8));
    }

    #[test]
    fn test_comparisons() {
        let row = record!(3i64, 3.0, "b", true);
        assert_eq!(eval(&col("id").eq(col("cost")), &row), Value::Boolean(true));
        assert_eq!(eval(&col("name").lt(lit("c")), &row), Value::Boolean(true));
        assert_eq!(eval(&col("id").gt_eq(lit(4i64)), &row), Value::Boolean(false));
    }

    #[test]
    fn test_resolution_errors() {
        let schema = schema();
        assert!(matches!(
            col("missing").resolve(&schema),
            Err(PlanError::Schema(_))
        ));
        assert!(matches!(
            col("name").gt(lit(1i64)).resolve(&schema),
            Err(PlanError::Type { .. })
        ));
        assert!(matches!(
            (col("name") + lit(1i64)).resolve(&schema),
            Err(PlanError::Type { .. })
        ));
        assert!(matches!(
            col("id").lower().resolve(&schema),
            Err(PlanError::Type { .. })
        ));
        assert!(lit(Value::Null).resolve(&schema).is_err());
    }

    #[test]
    fn test_display() {
        let e = col("cost").gt(lit(5.0)).and(col("name").eq(lit("Ann")));
        assert_eq!(e.to_string(), "((cost > 5) AND (name = 'Ann'))");
    }
}
