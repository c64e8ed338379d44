// Logical Schema Module
//
// A logical schema is an ordered list of key columns plus an ordered list of
// value columns. Once a query source has been read, the value additionally
// carries ROWTIME and copies of the key columns so that expressions can refer
// to them. Sinks strip those copies again before writing.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::column::{Column, Namespace, SqlType};
use super::{Result, SchemaError};

/// Name of the implicit record-timestamp column
pub const ROWTIME_NAME: &str = "ROWTIME";
/// Name of the implicit window-start column of windowed results
pub const WINDOWSTART_NAME: &str = "WINDOWSTART";
/// Name of the implicit window-end column of windowed results
pub const WINDOWEND_NAME: &str = "WINDOWEND";

/// Immutable key + value column layout
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalSchema {
    key: Vec<Column>,
    value: Vec<Column>,
}

impl LogicalSchema {
    pub fn builder() -> LogicalSchemaBuilder {
        LogicalSchemaBuilder::default()
    }

    pub fn key(&self) -> &[Column] {
        &self.key
    }

    /// Value columns, including any meta or key copies
    pub fn value(&self) -> &[Column] {
        &self.value
    }

    /// Key columns followed by value columns
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.key.iter().chain(self.value.iter())
    }

    pub fn find_value_column(&self, name: &str) -> Option<&Column> {
        self.value.iter().find(|c| c.name() == name)
    }

    pub fn find_key_column(&self, name: &str) -> Option<&Column> {
        self.key.iter().find(|c| c.name() == name)
    }

    /// Position of a column within the value, or an error naming the column
    pub fn value_index(&self, name: &str) -> Result<usize> {
        self.value
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))
    }

    /// Whether a value column is ROWTIME or a copy of a key column
    pub fn is_meta_or_key_copy(&self, column: &Column) -> bool {
        column.namespace() == Namespace::Meta || self.find_key_column(column.name()).is_some()
    }

    /// Prepend ROWTIME and copies of the key columns to the value.
    ///
    /// Any existing copies are removed first, so calling this twice yields
    /// the same schema as calling it once.
    pub fn with_meta_and_key_cols_in_value(&self) -> LogicalSchema {
        let base = self.without_meta_and_key_cols_in_value();

        let mut value = Vec::with_capacity(base.value.len() + base.key.len() + 1);
        value.push(Column::new(ROWTIME_NAME, SqlType::BigInt, Namespace::Meta, 0));
        for key_col in &base.key {
            value.push(Column::new(key_col.name(), key_col.sql_type(), Namespace::Value, 0));
        }
        value.extend(base.value.iter().cloned());

        LogicalSchema {
            key: base.key,
            value: reindex(value),
        }
    }

    /// Remove ROWTIME and key copies from the value
    pub fn without_meta_and_key_cols_in_value(&self) -> LogicalSchema {
        let value: Vec<Column> = self
            .value
            .iter()
            .filter(|c| !self.is_meta_or_key_copy(c))
            .cloned()
            .collect();

        LogicalSchema {
            key: self.key.clone(),
            value: reindex(value),
        }
    }

    /// A schema with the same value columns and no key
    pub fn value_only(&self) -> LogicalSchema {
        LogicalSchema {
            key: Vec::new(),
            value: self.value.clone(),
        }
    }

    /// Replace the key columns. Value columns keep their positions, since
    /// re-keying a record does not touch its value.
    pub fn with_key(&self, key: Vec<(String, SqlType)>) -> Result<LogicalSchema> {
        let mut seen = HashSet::new();
        for (name, _) in &key {
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
        }
        let key = key
            .into_iter()
            .enumerate()
            .map(|(i, (name, t))| Column::new(name, t, Namespace::Key, i))
            .collect();
        Ok(LogicalSchema {
            key,
            value: self.value.clone(),
        })
    }
}

fn reindex(columns: Vec<Column>) -> Vec<Column> {
    columns
        .into_iter()
        .enumerate()
        .map(|(i, c)| Column::new(c.name(), c.sql_type(), c.namespace(), i))
        .collect()
}

impl fmt::Display for LogicalSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.columns().map(|c| c.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Incrementally assembles a LogicalSchema, validating names on build
#[derive(Debug, Default, Clone)]
pub struct LogicalSchemaBuilder {
    key: Vec<(String, SqlType)>,
    value: Vec<(String, SqlType)>,
}

impl LogicalSchemaBuilder {
    pub fn key_column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.key.push((name.into(), sql_type));
        self
    }

    pub fn value_column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.value.push((name.into(), sql_type));
        self
    }

    pub fn value_columns<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = (String, SqlType)>,
    {
        self.value.extend(columns);
        self
    }

    /// Build the schema. Key and value names must be disjoint and unique.
    pub fn build(self) -> Result<LogicalSchema> {
        self.validate(false)?;
        Ok(self.assemble())
    }

    /// Build a schema whose value may repeat key columns, as projections
    /// over a source with key copies do.
    pub fn build_allowing_key_copies(self) -> Result<LogicalSchema> {
        self.validate(true)?;
        Ok(self.assemble())
    }

    fn validate(&self, allow_key_copies: bool) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, _) in &self.key {
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
        }
        let key_names = seen.clone();
        let mut value_names = HashSet::new();
        for (name, _) in &self.value {
            if name == ROWTIME_NAME {
                return Err(SchemaError::ReservedColumn(name.clone()));
            }
            if !value_names.insert(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
            if !allow_key_copies && key_names.contains(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
        }
        Ok(())
    }

    fn assemble(self) -> LogicalSchema {
        let key = self
            .key
            .into_iter()
            .enumerate()
            .map(|(i, (name, t))| Column::new(name, t, Namespace::Key, i))
            .collect();
        let value = self
            .value
            .into_iter()
            .enumerate()
            .map(|(i, (name, t))| Column::new(name, t, Namespace::Value, i))
            .collect();
        LogicalSchema { key, value }
    }
}
