// Column Module
//
// This module defines the SQL types and the Column type used by logical schemas.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::SchemaError;

/// Data types a column may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    BigInt,
    Double,
    String,
    Bytes,
}

impl SqlType {
    /// Convert a type name to a SqlType
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        match s.to_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => Ok(SqlType::Boolean),
            "INT" | "INTEGER" | "BIGINT" => Ok(SqlType::BigInt),
            "DOUBLE" | "FLOAT" | "REAL" => Ok(SqlType::Double),
            "STRING" | "VARCHAR" | "TEXT" => Ok(SqlType::String),
            "BYTES" | "BLOB" => Ok(SqlType::Bytes),
            _ => Err(SchemaError::UnknownType(s.to_string())),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SqlType::BigInt | SqlType::Double)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::String => "STRING",
            SqlType::Bytes => "BYTES",
        };
        write!(f, "{}", name)
    }
}

/// Where a column lives in a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Part of the record key
    Key,
    /// Part of the record value
    Value,
    /// Implicit metadata carried in the value, such as ROWTIME
    Meta,
}

/// Represents a column in a logical schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    name: String,
    sql_type: SqlType,
    namespace: Namespace,
    /// Position within its namespace's list
    index: usize,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType, namespace: Namespace, index: usize) -> Self {
        Column {
            name: name.into(),
            sql_type,
            namespace,
            index,
        }
    }

    /// Get the column name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the column type
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Namespace::Key => write!(f, "{} {} KEY", self.name, self.sql_type),
            _ => write!(f, "{} {}", self.name, self.sql_type),
        }
    }
}
