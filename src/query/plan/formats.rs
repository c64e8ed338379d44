use std::fmt;

use serde::{Deserialize, Serialize};

/// Serialization format of a key or value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Json,
    Delimited,
    Binary,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => write!(f, "JSON"),
            Format::Delimited => write!(f, "DELIMITED"),
            Format::Binary => write!(f, "BINARY"),
        }
    }
}

/// Per-source serde options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerdeOptions {
    /// Write a single-column value as the bare column value rather than a record
    pub unwrap_single_values: bool,
}

/// Key and value formats of a step's input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Formats {
    pub key: Format,
    pub value: Format,
    #[serde(default)]
    pub options: SerdeOptions,
}

impl Formats {
    pub fn new(key: Format, value: Format) -> Self {
        Formats {
            key,
            value,
            options: SerdeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SerdeOptions) -> Self {
        self.options = options;
        self
    }
}

impl Default for Formats {
    fn default() -> Self {
        Formats::new(Format::Json, Format::Json)
    }
}
