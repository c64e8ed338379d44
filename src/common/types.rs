use std::fmt;

use serde::{Deserialize, Serialize};

/// Offset of a record within a topic or the command log
pub type Offset = u64;

/// Event time in milliseconds since the epoch
pub type Timestamp = i64;

/// Identifier of a query (persistent or transient)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of windowing applied to a keyed aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowType {
    Tumbling,
    Hopping,
    Session,
}

impl WindowType {
    /// Session windows have data-driven bounds, so both ends travel with the key
    pub fn requires_window_end(&self) -> bool {
        matches!(self, WindowType::Session)
    }
}

/// Bounds of a single window.
///
/// Time windows are half-open `[start, end)`. Session windows are closed
/// `[start, end]`, where `end` is the timestamp of the latest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Window { start, end }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Whether a data source is an append-only stream or a changelog table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourceType {
    Stream,
    Table,
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceType::Stream => write!(f, "STREAM"),
            DataSourceType::Table => write!(f, "TABLE"),
        }
    }
}
