// Expression Model
//
// Expressions used by projections, filters, group-by keys and aggregate
// arguments. An expression is bound against a schema once, at build time,
// resolving column names to value positions; the bound form is what runs
// per record.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{DataValue, GenericRow, LogicalSchema, SqlType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Column not found: {0}")]
    ColumnNotFound(String),
    #[error("Cannot apply {op} to {left} and {right}")]
    TypeMismatch { op: BinaryOperator, left: String, right: String },
    #[error("Cannot determine the type of a NULL literal")]
    UntypedNull,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Integer overflow in {0}")]
    Overflow(BinaryOperator),
}

pub type Result<T> = std::result::Result<T, ExpressionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

impl BinaryOperator {
    fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo
        )
    }

    fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Equals => "=",
            BinaryOperator::NotEquals => "<>",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        };
        write!(f, "{}", symbol)
    }
}

/// An unbound expression over named columns
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    Column(String),
    Literal(DataValue),
    Binary {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    IsNull(Box<Expression>),
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column(name.into())
    }

    pub fn literal(value: DataValue) -> Self {
        Expression::Literal(value)
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Names of every column this expression references
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Column(name) => out.push(name),
            Expression::Literal(_) => {}
            Expression::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expression::Not(inner) | Expression::IsNull(inner) => inner.collect_columns(out),
        }
    }

    /// Derive the result type of this expression against a schema's value columns
    pub fn result_type(&self, schema: &LogicalSchema) -> Result<SqlType> {
        match self {
            Expression::Column(name) => schema
                .find_value_column(name)
                .map(|c| c.sql_type())
                .ok_or_else(|| ExpressionError::ColumnNotFound(name.clone())),
            Expression::Literal(value) => value.sql_type().ok_or(ExpressionError::UntypedNull),
            Expression::Not(_) | Expression::IsNull(_) => Ok(SqlType::Boolean),
            Expression::Binary { left, op, right } => {
                if op.is_arithmetic() {
                    let l = left.result_type(schema)?;
                    let r = right.result_type(schema)?;
                    match (l, r) {
                        (SqlType::BigInt, SqlType::BigInt) => Ok(SqlType::BigInt),
                        (a, b) if a.is_numeric() && b.is_numeric() => Ok(SqlType::Double),
                        (SqlType::String, SqlType::String) if *op == BinaryOperator::Add => Ok(SqlType::String),
                        (a, b) => Err(ExpressionError::TypeMismatch {
                            op: *op,
                            left: a.to_string(),
                            right: b.to_string(),
                        }),
                    }
                } else {
                    Ok(SqlType::Boolean)
                }
            }
        }
    }

    /// Resolve column names to value positions
    pub fn bind(&self, schema: &LogicalSchema) -> Result<BoundExpression> {
        Ok(match self {
            Expression::Column(name) => {
                let index = schema
                    .value_index(name)
                    .map_err(|_| ExpressionError::ColumnNotFound(name.clone()))?;
                BoundExpression::Column(index)
            }
            Expression::Literal(value) => BoundExpression::Literal(value.clone()),
            Expression::Binary { left, op, right } => BoundExpression::Binary {
                left: Box::new(left.bind(schema)?),
                op: *op,
                right: Box::new(right.bind(schema)?),
            },
            Expression::Not(inner) => BoundExpression::Not(Box::new(inner.bind(schema)?)),
            Expression::IsNull(inner) => BoundExpression::IsNull(Box::new(inner.bind(schema)?)),
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Column(name) => write!(f, "{}", name),
            Expression::Literal(DataValue::Text(s)) => write!(f, "'{}'", s),
            Expression::Literal(value) => write!(f, "{}", value),
            Expression::Binary { left, op, right } => write!(f, "({} {} {})", left, op, right),
            Expression::Not(inner) => write!(f, "(NOT {})", inner),
            Expression::IsNull(inner) => write!(f, "({} IS NULL)", inner),
        }
    }
}

/// An expression whose columns have been resolved to value positions
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpression {
    Column(usize),
    Literal(DataValue),
    Binary {
        left: Box<BoundExpression>,
        op: BinaryOperator,
        right: Box<BoundExpression>,
    },
    Not(Box<BoundExpression>),
    IsNull(Box<BoundExpression>),
}

impl BoundExpression {
    /// Evaluate against a row. NULL propagates through arithmetic and comparison.
    pub fn evaluate(&self, row: &GenericRow) -> Result<DataValue> {
        match self {
            BoundExpression::Column(index) => Ok(row.get(*index).cloned().unwrap_or(DataValue::Null)),
            BoundExpression::Literal(value) => Ok(value.clone()),
            BoundExpression::Not(inner) => Ok(match inner.evaluate(row)? {
                DataValue::Boolean(b) => DataValue::Boolean(!b),
                _ => DataValue::Null,
            }),
            BoundExpression::IsNull(inner) => Ok(DataValue::Boolean(inner.evaluate(row)?.is_null())),
            BoundExpression::Binary { left, op, right } => {
                let l = left.evaluate(row)?;
                if op.is_logical() {
                    return evaluate_logical(*op, l, || right.evaluate(row));
                }
                let r = right.evaluate(row)?;
                if l.is_null() || r.is_null() {
                    return Ok(DataValue::Null);
                }
                if op.is_arithmetic() {
                    evaluate_arithmetic(*op, &l, &r)
                } else {
                    evaluate_comparison(*op, &l, &r)
                }
            }
        }
    }

    /// Evaluate as a predicate: anything other than TRUE rejects the row
    pub fn matches(&self, row: &GenericRow) -> Result<bool> {
        Ok(matches!(self.evaluate(row)?, DataValue::Boolean(true)))
    }
}

fn evaluate_logical<F>(op: BinaryOperator, left: DataValue, right: F) -> Result<DataValue>
where
    F: FnOnce() -> Result<DataValue>,
{
    let l = left.as_bool();
    // short circuit
    match (op, l) {
        (BinaryOperator::And, Some(false)) => return Ok(DataValue::Boolean(false)),
        (BinaryOperator::Or, Some(true)) => return Ok(DataValue::Boolean(true)),
        _ => {}
    }
    let r = right()?.as_bool();
    Ok(match (op, l, r) {
        (BinaryOperator::And, Some(true), Some(b)) => DataValue::Boolean(b),
        (BinaryOperator::And, _, Some(false)) => DataValue::Boolean(false),
        (BinaryOperator::Or, Some(false), Some(b)) => DataValue::Boolean(b),
        (BinaryOperator::Or, _, Some(true)) => DataValue::Boolean(true),
        _ => DataValue::Null,
    })
}

fn evaluate_arithmetic(op: BinaryOperator, l: &DataValue, r: &DataValue) -> Result<DataValue> {
    if let (DataValue::Integer(a), DataValue::Integer(b)) = (l, r) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOperator::Add => a.checked_add(b),
            BinaryOperator::Subtract => a.checked_sub(b),
            BinaryOperator::Multiply => a.checked_mul(b),
            BinaryOperator::Divide | BinaryOperator::Modulo if b == 0 => {
                return Err(ExpressionError::DivisionByZero);
            }
            BinaryOperator::Divide => a.checked_div(b),
            BinaryOperator::Modulo => a.checked_rem(b),
            _ => None,
        };
        return result.map(DataValue::Integer).ok_or(ExpressionError::Overflow(op));
    }

    if let (DataValue::Text(a), DataValue::Text(b), BinaryOperator::Add) = (l, r, op) {
        return Ok(DataValue::Text(format!("{}{}", a, b)));
    }

    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok(DataValue::Float(match op {
            BinaryOperator::Add => a + b,
            BinaryOperator::Subtract => a - b,
            BinaryOperator::Multiply => a * b,
            BinaryOperator::Divide => a / b,
            _ => a % b,
        })),
        _ => Err(mismatch(op, l, r)),
    }
}

fn evaluate_comparison(op: BinaryOperator, l: &DataValue, r: &DataValue) -> Result<DataValue> {
    let ordering = l.partial_cmp(r).ok_or_else(|| mismatch(op, l, r))?;
    let result = match op {
        BinaryOperator::Equals => ordering.is_eq(),
        BinaryOperator::NotEquals => ordering.is_ne(),
        BinaryOperator::LessThan => ordering.is_lt(),
        BinaryOperator::LessThanOrEqual => ordering.is_le(),
        BinaryOperator::GreaterThan => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(DataValue::Boolean(result))
}

fn mismatch(op: BinaryOperator, l: &DataValue, r: &DataValue) -> ExpressionError {
    let describe = |v: &DataValue| v.sql_type().map(|t| t.to_string()).unwrap_or_else(|| "NULL".to_string());
    ExpressionError::TypeMismatch {
        op,
        left: describe(l),
        right: describe(r),
    }
}
