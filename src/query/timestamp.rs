// Timestamp Extraction
//
// How a source decides the event time of each record: the record's own
// timestamp, a BIGINT column holding epoch millis, or a STRING column parsed
// with a chrono format string.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{DataValue, GenericRow, LogicalSchema, SqlType};
use crate::common::types::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimestampError {
    #[error("Timestamp column {0} not found")]
    ColumnNotFound(String),
    #[error("Timestamp column {column} must be BIGINT or STRING with a format, was {actual}")]
    InvalidColumnType { column: String, actual: SqlType },
    #[error("Timestamp column {0} of type STRING requires a format")]
    MissingFormat(String),
    #[error("Timestamp column value is NULL")]
    NullTimestamp,
    #[error("Failed to parse timestamp '{value}' with format '{format}'")]
    Unparseable { value: String, format: String },
}

pub type Result<T> = std::result::Result<T, TimestampError>;

/// The user-declared timestamp column of a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampColumn {
    pub column: String,
    pub format: Option<String>,
}

impl TimestampColumn {
    pub fn new(column: impl Into<String>, format: Option<String>) -> Self {
        TimestampColumn {
            column: column.into(),
            format,
        }
    }
}

/// Structural description of how event time is chosen
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimestampPolicy {
    Metadata,
    LongColumn { column: String },
    StringColumn { column: String, format: String },
}

impl TimestampPolicy {
    /// Choose a policy for a source, validating the column against its schema
    pub fn for_source(timestamp_column: Option<&TimestampColumn>, schema: &LogicalSchema) -> Result<Self> {
        let Some(ts) = timestamp_column else {
            return Ok(TimestampPolicy::Metadata);
        };
        let column = schema
            .find_value_column(&ts.column)
            .ok_or_else(|| TimestampError::ColumnNotFound(ts.column.clone()))?;

        match (column.sql_type(), &ts.format) {
            (SqlType::BigInt, _) => Ok(TimestampPolicy::LongColumn {
                column: ts.column.clone(),
            }),
            (SqlType::String, Some(format)) => Ok(TimestampPolicy::StringColumn {
                column: ts.column.clone(),
                format: format.clone(),
            }),
            (SqlType::String, None) => Err(TimestampError::MissingFormat(ts.column.clone())),
            (actual, _) => Err(TimestampError::InvalidColumnType {
                column: ts.column.clone(),
                actual,
            }),
        }
    }

    /// Build the per-record extractor, resolving the column against the
    /// source's declared value layout
    pub fn create(&self, schema: &LogicalSchema) -> Result<TimestampExtractor> {
        let index_of = |column: &str| {
            schema
                .without_meta_and_key_cols_in_value()
                .value_index(column)
                .map_err(|_| TimestampError::ColumnNotFound(column.to_string()))
        };
        Ok(match self {
            TimestampPolicy::Metadata => TimestampExtractor::Metadata,
            TimestampPolicy::LongColumn { column } => TimestampExtractor::Long { index: index_of(column)? },
            TimestampPolicy::StringColumn { column, format } => TimestampExtractor::String {
                index: index_of(column)?,
                format: format.clone(),
            },
        })
    }
}

/// Per-record timestamp extraction
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampExtractor {
    Metadata,
    Long { index: usize },
    String { index: usize, format: String },
}

impl TimestampExtractor {
    pub fn extract(&self, record_timestamp: Timestamp, row: &GenericRow) -> Result<Timestamp> {
        match self {
            TimestampExtractor::Metadata => Ok(record_timestamp),
            TimestampExtractor::Long { index } => match row.get(*index) {
                Some(DataValue::Integer(ts)) => Ok(*ts),
                _ => Err(TimestampError::NullTimestamp),
            },
            TimestampExtractor::String { index, format } => match row.get(*index) {
                Some(DataValue::Text(text)) => parse_timestamp(text, format),
                _ => Err(TimestampError::NullTimestamp),
            },
        }
    }
}

/// Parse a formatted timestamp into epoch millis. Values without an offset are UTC.
pub fn parse_timestamp(value: &str, format: &str) -> Result<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_str(value, format) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
        return Ok(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(TimestampError::Unparseable {
        value: value.to_string(),
        format: format.to_string(),
    })
}
