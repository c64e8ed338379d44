//! Catalog Module
//!
//! Column types, logical schemas, the row value model and the metastore of
//! registered streams and tables.

pub mod column;
pub mod metastore;
pub mod schema;
pub mod value;

pub use self::column::{Column, Namespace, SqlType};
pub use self::metastore::{DataSource, MetaStore, MetaStoreError};
pub use self::schema::{LogicalSchema, LogicalSchemaBuilder, ROWTIME_NAME, WINDOWEND_NAME, WINDOWSTART_NAME};
pub use self::value::{DataValue, GenericRow, RowKey};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),
    #[error("Column {0} is reserved")]
    ReservedColumn(String),
    #[error("Column not found: {0}")]
    ColumnNotFound(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Type mismatch for {column}: expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: SqlType,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, SchemaError>;
