// Aggregate Functions
//
// Each aggregate function owns a fixed number of intermediate columns in the
// aggregate record. Folding a record, undoing a record (table aggregation),
// merging two partial aggregates (session windows) and producing the visible
// result all operate on that slice of the record.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{DataValue, SqlType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    /// Start of the record's window, filled in after aggregation
    WindowStart,
    /// End of the record's window, filled in after aggregation
    WindowEnd,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::WindowStart => "WINDOWSTART",
            AggregateFunction::WindowEnd => "WINDOWEND",
        };
        write!(f, "{}", name)
    }
}

impl AggregateFunction {
    pub fn is_window_bound(&self) -> bool {
        matches!(self, AggregateFunction::WindowStart | AggregateFunction::WindowEnd)
    }

    /// Whether a previously folded value can be removed again
    pub fn supports_undo(&self) -> bool {
        matches!(self, AggregateFunction::Count | AggregateFunction::Sum | AggregateFunction::Avg)
    }

    /// Types of the intermediate columns kept in the aggregate record
    pub fn intermediate_types(&self, arg: Option<SqlType>) -> Result<Vec<SqlType>, String> {
        match self {
            AggregateFunction::Count | AggregateFunction::WindowStart | AggregateFunction::WindowEnd => {
                Ok(vec![SqlType::BigInt])
            }
            AggregateFunction::Avg => {
                self.numeric_argument(arg)?;
                Ok(vec![SqlType::Double, SqlType::BigInt])
            }
            AggregateFunction::Sum => Ok(vec![self.numeric_argument(arg)?]),
            AggregateFunction::Min | AggregateFunction::Max => match arg {
                Some(SqlType::Boolean) | Some(SqlType::Bytes) => {
                    Err(format!("{} does not support arguments of type {}", self, arg.map(|t| t.to_string()).unwrap_or_default()))
                }
                Some(t) => Ok(vec![t]),
                None => Err(format!("{} requires an argument", self)),
            },
        }
    }

    /// Type of the externally visible result column
    pub fn result_type(&self, arg: Option<SqlType>) -> Result<SqlType, String> {
        match self {
            AggregateFunction::Avg => {
                self.numeric_argument(arg)?;
                Ok(SqlType::Double)
            }
            _ => Ok(self.intermediate_types(arg)?[0]),
        }
    }

    fn numeric_argument(&self, arg: Option<SqlType>) -> Result<SqlType, String> {
        match arg {
            Some(t) if t.is_numeric() => Ok(t),
            Some(t) => Err(format!("{} does not support arguments of type {}", self, t)),
            None => Err(format!("{} requires an argument", self)),
        }
    }

    fn initial_values(&self, arg: Option<SqlType>) -> Vec<DataValue> {
        match self {
            AggregateFunction::Count => vec![DataValue::Integer(0)],
            AggregateFunction::Sum => vec![zero(arg)],
            AggregateFunction::Avg => vec![DataValue::Float(0.0), DataValue::Integer(0)],
            _ => vec![DataValue::Null],
        }
    }
}

fn zero(sql_type: Option<SqlType>) -> DataValue {
    match sql_type {
        Some(SqlType::Double) => DataValue::Float(0.0),
        _ => DataValue::Integer(0),
    }
}

/// A call of an aggregate function on an optional argument column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateCall {
    pub function: AggregateFunction,
    pub argument: Option<String>,
}

impl AggregateCall {
    pub fn new(function: AggregateFunction, argument: Option<&str>) -> Self {
        AggregateCall {
            function,
            argument: argument.map(str::to_string),
        }
    }
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            Some(arg) => write!(f, "{}({})", self.function, arg),
            None if self.function == AggregateFunction::Count => write!(f, "COUNT(*)"),
            None => write!(f, "{}()", self.function),
        }
    }
}

/// An aggregate call resolved against its input and its place in the aggregate record
#[derive(Debug, Clone, PartialEq)]
pub struct BoundAggregate {
    pub function: AggregateFunction,
    /// Position of the argument in the input row
    pub arg_index: Option<usize>,
    pub arg_type: Option<SqlType>,
    /// Position of the first intermediate column in the aggregate record
    pub offset: usize,
    pub width: usize,
}

impl BoundAggregate {
    pub fn initial_values(&self) -> Vec<DataValue> {
        self.function.initial_values(self.arg_type)
    }

    fn argument<'a>(&self, input: &'a [DataValue]) -> &'a DataValue {
        self.arg_index.and_then(|i| input.get(i)).unwrap_or(&DataValue::Null)
    }

    fn slot<'a>(&self, agg: &'a mut [DataValue]) -> &'a mut [DataValue] {
        &mut agg[self.offset..self.offset + self.width]
    }

    /// Fold one input row into the aggregate record
    pub fn fold(&self, input: &[DataValue], agg: &mut [DataValue]) {
        let arg = self.argument(input).clone();
        let counts_row = self.arg_index.is_none() || !arg.is_null();
        let slot = self.slot(agg);
        match self.function {
            AggregateFunction::Count => {
                if counts_row {
                    slot[0] = add(&slot[0], &DataValue::Integer(1));
                }
            }
            AggregateFunction::Sum if !arg.is_null() => slot[0] = add(&slot[0], &arg),
            AggregateFunction::Avg if !arg.is_null() => {
                slot[0] = add(&slot[0], &DataValue::Float(arg.as_f64().unwrap_or(0.0)));
                slot[1] = add(&slot[1], &DataValue::Integer(1));
            }
            AggregateFunction::Min if !arg.is_null() => slot[0] = pick(&slot[0], arg, Ordering::Less),
            AggregateFunction::Max if !arg.is_null() => slot[0] = pick(&slot[0], arg, Ordering::Greater),
            _ => {}
        }
    }

    /// Remove a previously folded input row from the aggregate record
    pub fn undo(&self, input: &[DataValue], agg: &mut [DataValue]) {
        let arg = self.argument(input).clone();
        let counted = self.arg_index.is_none() || !arg.is_null();
        let slot = self.slot(agg);
        match self.function {
            AggregateFunction::Count => {
                if counted {
                    slot[0] = subtract(&slot[0], &DataValue::Integer(1));
                }
            }
            AggregateFunction::Sum if !arg.is_null() => slot[0] = subtract(&slot[0], &arg),
            AggregateFunction::Avg if !arg.is_null() => {
                slot[0] = subtract(&slot[0], &DataValue::Float(arg.as_f64().unwrap_or(0.0)));
                slot[1] = subtract(&slot[1], &DataValue::Integer(1));
            }
            _ => {}
        }
    }

    /// Merge the intermediate values of `other` into `agg`
    pub fn merge(&self, other: &[DataValue], agg: &mut [DataValue]) {
        let theirs: Vec<DataValue> = other[self.offset..self.offset + self.width].to_vec();
        let slot = self.slot(agg);
        match self.function {
            AggregateFunction::Count | AggregateFunction::Sum | AggregateFunction::Avg => {
                for (mine, their) in slot.iter_mut().zip(theirs.iter()) {
                    *mine = add(mine, their);
                }
            }
            AggregateFunction::Min if !theirs[0].is_null() => slot[0] = pick(&slot[0], theirs[0].clone(), Ordering::Less),
            AggregateFunction::Max if !theirs[0].is_null() => slot[0] = pick(&slot[0], theirs[0].clone(), Ordering::Greater),
            _ => {}
        }
    }

    /// The visible result for this function's intermediate values
    pub fn result(&self, agg: &[DataValue]) -> DataValue {
        let slot = &agg[self.offset..self.offset + self.width];
        match self.function {
            AggregateFunction::Avg => match (slot[0].as_f64(), slot[1].as_i64()) {
                (Some(sum), Some(count)) if count > 0 => DataValue::Float(sum / count as f64),
                _ => DataValue::Null,
            },
            _ => slot[0].clone(),
        }
    }
}

fn add(a: &DataValue, b: &DataValue) -> DataValue {
    match (a, b) {
        (DataValue::Integer(x), DataValue::Integer(y)) => DataValue::Integer(x.wrapping_add(*y)),
        (DataValue::Null, other) | (other, DataValue::Null) => other.clone(),
        (x, y) => DataValue::Float(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0)),
    }
}

fn subtract(a: &DataValue, b: &DataValue) -> DataValue {
    match (a, b) {
        (DataValue::Integer(x), DataValue::Integer(y)) => DataValue::Integer(x.wrapping_sub(*y)),
        (x, y) => DataValue::Float(x.as_f64().unwrap_or(0.0) - y.as_f64().unwrap_or(0.0)),
    }
}

/// Keep whichever of `current` and `candidate` sorts towards `wanted`
fn pick(current: &DataValue, candidate: DataValue, wanted: Ordering) -> DataValue {
    if current.is_null() || candidate.partial_cmp(current) == Some(wanted) {
        candidate
    } else {
        current.clone()
    }
}
