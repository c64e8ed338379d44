// Row Value Model
//
// This module defines the values that flow through a running query: single
// column values, value rows and record keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::column::SqlType;
use crate::common::types::Window;

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Blob(Vec<u8>),
}

impl Eq for DataValue {}

impl Hash for DataValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            DataValue::Null => 0.hash(state),
            DataValue::Integer(i) => { 1.hash(state); i.hash(state); }
            DataValue::Float(f) => { 2.hash(state); f.to_bits().hash(state); }
            DataValue::Text(s) => { 3.hash(state); s.hash(state); }
            DataValue::Boolean(b) => { 4.hash(state); b.hash(state); }
            DataValue::Blob(b) => { 5.hash(state); b.hash(state); }
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Integer(i) => write!(f, "{}", i),
            DataValue::Float(fl) => write!(f, "{}", fl),
            DataValue::Text(s) => write!(f, "{}", s),
            DataValue::Boolean(b) => write!(f, "{}", b),
            DataValue::Blob(b) => write!(f, "X'{}'", hex::encode(b)),
        }
    }
}

impl PartialOrd for DataValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => Some(Ordering::Equal),
            (DataValue::Null, _) => Some(Ordering::Less),
            (_, DataValue::Null) => Some(Ordering::Greater),

            (DataValue::Integer(a), DataValue::Integer(b)) => a.partial_cmp(b),
            (DataValue::Float(a), DataValue::Float(b)) => a.partial_cmp(b),
            (DataValue::Integer(a), DataValue::Float(b)) => (*a as f64).partial_cmp(b),
            (DataValue::Float(a), DataValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (DataValue::Text(a), DataValue::Text(b)) => Some(a.cmp(b)),
            (DataValue::Boolean(a), DataValue::Boolean(b)) => a.partial_cmp(b),
            (DataValue::Blob(a), DataValue::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// The SQL type of this value, or `None` for NULL
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            DataValue::Null => None,
            DataValue::Integer(_) => Some(SqlType::BigInt),
            DataValue::Float(_) => Some(SqlType::Double),
            DataValue::Text(_) => Some(SqlType::String),
            DataValue::Boolean(_) => Some(SqlType::Boolean),
            DataValue::Blob(_) => Some(SqlType::Bytes),
        }
    }

    /// NULL is compatible with every type; BIGINT widens to DOUBLE
    pub fn is_compatible_with(&self, target: SqlType) -> bool {
        match self.sql_type() {
            None => true,
            Some(actual) => actual == target || (actual == SqlType::BigInt && target == SqlType::Double),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Integer(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// An ordered list of column values, laid out as the value columns of a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericRow {
    values: Vec<DataValue>,
}

impl GenericRow {
    pub fn new(values: Vec<DataValue>) -> Self {
        GenericRow { values }
    }

    /// A row of `len` NULLs
    pub fn nulls(len: usize) -> Self {
        GenericRow { values: vec![DataValue::Null; len] }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DataValue> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: DataValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn push(&mut self, value: DataValue) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<DataValue> {
        self.values
    }
}

impl From<Vec<DataValue>> for GenericRow {
    fn from(values: Vec<DataValue>) -> Self {
        GenericRow::new(values)
    }
}

impl fmt::Display for GenericRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Key of a record: the key column values plus, for windowed results, the window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    values: Vec<DataValue>,
    window: Option<Window>,
}

impl RowKey {
    pub fn new(values: Vec<DataValue>) -> Self {
        RowKey { values, window: None }
    }

    pub fn windowed(values: Vec<DataValue>, window: Window) -> Self {
        RowKey { values, window: Some(window) }
    }

    /// Key of a record that arrived without one
    pub fn empty() -> Self {
        RowKey { values: Vec::new(), window: None }
    }

    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    pub fn window(&self) -> Option<Window> {
        self.window
    }

    /// Same key values, different (or no) window
    pub fn with_window(&self, window: Option<Window>) -> Self {
        RowKey { values: self.values.clone(), window }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        match self.window {
            Some(w) => write!(f, "{}@{}", parts.join("|"), w),
            None => write!(f, "{}", parts.join("|")),
        }
    }
}
