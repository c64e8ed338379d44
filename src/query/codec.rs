// Key and Value Codecs
//
// Rows travel between queries as bytes. Values use the source's value
// format; keys use the key format, followed for windowed keys by the window
// start (and, for session windows, the end) as big-endian i64s.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use linked_hash_map::LinkedHashMap;
use serde_json::{Number, Value};
use thiserror::Error;

use crate::catalog::{DataValue, GenericRow, LogicalSchema, RowKey, SqlType};
use crate::common::types::{Window, WindowType};
use crate::query::plan::{Format, SerdeOptions, WindowInfo};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Invalid DELIMITED record: {0}")]
    Delimited(String),
    #[error("Invalid BINARY record: {0}")]
    Binary(String),
    #[error("Expected {expected} columns, got {actual}")]
    ColumnCount { expected: usize, actual: usize },
    #[error("Cannot read '{value}' as {expected} for column {column}")]
    Type { column: String, expected: SqlType, value: String },
    #[error("Windowed key is missing its window bounds")]
    WindowBounds,
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Clone, PartialEq)]
struct RowFormat {
    format: Format,
    columns: Vec<(String, SqlType)>,
    unwrap_single: bool,
}

impl RowFormat {
    fn encode(&self, values: &[DataValue]) -> Result<Vec<u8>> {
        if values.len() != self.columns.len() {
            return Err(CodecError::ColumnCount {
                expected: self.columns.len(),
                actual: values.len(),
            });
        }
        match self.format {
            Format::Json => {
                let encoded = if self.unwrap_single && values.len() == 1 {
                    serde_json::to_vec(&to_json(&values[0]))
                } else {
                    let mut object = LinkedHashMap::new();
                    for ((name, _), value) in self.columns.iter().zip(values) {
                        object.insert(name.clone(), to_json(value));
                    }
                    serde_json::to_vec(&object)
                };
                encoded.map_err(|e| CodecError::Json(e.to_string()))
            }
            Format::Delimited => {
                let fields: Vec<String> = values.iter().map(delimited_field).collect();
                Ok(fields.join(",").into_bytes())
            }
            Format::Binary => bincode::serialize(values).map_err(|e| CodecError::Binary(e.to_string())),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<DataValue>> {
        let values = match self.format {
            Format::Json => self.decode_json(bytes)?,
            Format::Delimited => {
                let text = std::str::from_utf8(bytes).map_err(|e| CodecError::Delimited(e.to_string()))?;
                let fields = split_delimited(text)?;
                if fields.len() != self.columns.len() {
                    return Err(CodecError::ColumnCount {
                        expected: self.columns.len(),
                        actual: fields.len(),
                    });
                }
                self.columns
                    .iter()
                    .zip(fields)
                    .map(|((name, t), field)| parse_delimited(name, *t, field))
                    .collect::<Result<Vec<_>>>()?
            }
            Format::Binary => {
                let values: Vec<DataValue> =
                    bincode::deserialize(bytes).map_err(|e| CodecError::Binary(e.to_string()))?;
                if values.len() != self.columns.len() {
                    return Err(CodecError::ColumnCount {
                        expected: self.columns.len(),
                        actual: values.len(),
                    });
                }
                for ((name, t), value) in self.columns.iter().zip(&values) {
                    if !value.is_compatible_with(*t) {
                        return Err(CodecError::Type {
                            column: name.clone(),
                            expected: *t,
                            value: value.to_string(),
                        });
                    }
                }
                values
            }
        };
        Ok(values)
    }

    fn decode_json(&self, bytes: &[u8]) -> Result<Vec<DataValue>> {
        if self.unwrap_single && self.columns.len() == 1 {
            let value: Value = serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
            let (name, t) = &self.columns[0];
            return Ok(vec![from_json(name, *t, &value)?]);
        }
        let object: LinkedHashMap<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
        self.columns
            .iter()
            .map(|(name, t)| {
                let field = object
                    .get(name)
                    .or_else(|| object.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v));
                match field {
                    Some(v) => from_json(name, *t, v),
                    None => Ok(DataValue::Null),
                }
            })
            .collect()
    }
}

fn to_json(value: &DataValue) -> Value {
    match value {
        DataValue::Null => Value::Null,
        DataValue::Integer(i) => Value::Number((*i).into()),
        DataValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        DataValue::Text(s) => Value::String(s.clone()),
        DataValue::Boolean(b) => Value::Bool(*b),
        DataValue::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn from_json(column: &str, sql_type: SqlType, value: &Value) -> Result<DataValue> {
    let mismatch = || CodecError::Type {
        column: column.to_string(),
        expected: sql_type,
        value: value.to_string(),
    };
    if value.is_null() {
        return Ok(DataValue::Null);
    }
    match sql_type {
        SqlType::BigInt => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .map(DataValue::Integer)
            .ok_or_else(mismatch),
        SqlType::Double => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .map(DataValue::Float)
            .ok_or_else(mismatch),
        SqlType::Boolean => match value {
            Value::Bool(b) => Ok(DataValue::Boolean(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(DataValue::Boolean(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(DataValue::Boolean(false)),
            _ => Err(mismatch()),
        },
        SqlType::String => Ok(DataValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        SqlType::Bytes => value
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .map(DataValue::Blob)
            .ok_or_else(mismatch),
    }
}

fn delimited_field(value: &DataValue) -> String {
    match value {
        DataValue::Null => String::new(),
        DataValue::Blob(b) => hex::encode(b),
        DataValue::Text(s) if s.contains(',') || s.contains('"') || s.is_empty() => {
            format!("\"{}\"", s.replace('"', "\"\""))
        }
        other => other.to_string(),
    }
}

/// Split on commas, honouring double-quoted fields. Returns `None` for empty unquoted fields.
fn split_delimited(text: &str) -> Result<Vec<Option<String>>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' if quoted => quoted = false,
            '"' if current.is_empty() => {
                quoted = true;
                was_quoted = true;
            }
            ',' if !quoted => {
                fields.push(finish_field(&mut current, &mut was_quoted));
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(CodecError::Delimited(format!("unterminated quote in '{}'", text)));
    }
    fields.push(finish_field(&mut current, &mut was_quoted));
    Ok(fields)
}

fn finish_field(current: &mut String, was_quoted: &mut bool) -> Option<String> {
    let field = std::mem::take(current);
    let quoted = std::mem::replace(was_quoted, false);
    if field.is_empty() && !quoted {
        None
    } else {
        Some(field)
    }
}

fn parse_delimited(column: &str, sql_type: SqlType, field: Option<String>) -> Result<DataValue> {
    let Some(field) = field else {
        return Ok(DataValue::Null);
    };
    let mismatch = || CodecError::Type {
        column: column.to_string(),
        expected: sql_type,
        value: field.clone(),
    };
    match sql_type {
        SqlType::BigInt => field.trim().parse().map(DataValue::Integer).map_err(|_| mismatch()),
        SqlType::Double => field.trim().parse().map(DataValue::Float).map_err(|_| mismatch()),
        SqlType::Boolean => match field.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(DataValue::Boolean(true)),
            "false" => Ok(DataValue::Boolean(false)),
            _ => Err(mismatch()),
        },
        SqlType::String => Ok(DataValue::Text(field.clone())),
        SqlType::Bytes => hex::decode(field.trim()).map(DataValue::Blob).map_err(|_| mismatch()),
    }
}

/// Serializes value rows in a source's value format
#[derive(Debug, Clone, PartialEq)]
pub struct ValueCodec {
    row: RowFormat,
}

impl ValueCodec {
    /// `schema` is the physical value layout, without meta or key copies
    pub fn new(format: Format, schema: &LogicalSchema, options: SerdeOptions) -> Self {
        ValueCodec {
            row: RowFormat {
                format,
                columns: schema.value().iter().map(|c| (c.name().to_string(), c.sql_type())).collect(),
                unwrap_single: options.unwrap_single_values,
            },
        }
    }

    pub fn serialize(&self, row: Option<&GenericRow>) -> Result<Option<Vec<u8>>> {
        row.map(|r| self.row.encode(r.values())).transpose()
    }

    pub fn deserialize(&self, bytes: Option<&[u8]>) -> Result<Option<GenericRow>> {
        bytes.map(|b| self.row.decode(b).map(GenericRow::new)).transpose()
    }
}

/// Serializes record keys, including window bounds for windowed keys
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCodec {
    row: RowFormat,
    window: Option<WindowInfo>,
}

impl KeyCodec {
    pub fn new(format: Format, schema: &LogicalSchema, window: Option<WindowInfo>) -> Self {
        KeyCodec {
            row: RowFormat {
                format,
                columns: schema.key().iter().map(|c| (c.name().to_string(), c.sql_type())).collect(),
                unwrap_single: true,
            },
            window,
        }
    }

    pub fn is_windowed(&self) -> bool {
        self.window.is_some()
    }

    pub fn serialize(&self, key: &RowKey) -> Result<Option<Vec<u8>>> {
        if self.row.columns.is_empty() && self.window.is_none() {
            return Ok(None);
        }
        let mut bytes = if self.row.columns.is_empty() {
            Vec::new()
        } else {
            self.row.encode(key.values())?
        };
        if let Some(info) = self.window {
            let window = key.window().ok_or(CodecError::WindowBounds)?;
            bytes.write_i64::<BigEndian>(window.start).map_err(|e| CodecError::Binary(e.to_string()))?;
            if info.window_type == WindowType::Session {
                bytes.write_i64::<BigEndian>(window.end).map_err(|e| CodecError::Binary(e.to_string()))?;
            }
        }
        Ok(Some(bytes))
    }

    pub fn deserialize(&self, bytes: Option<&[u8]>) -> Result<RowKey> {
        let Some(bytes) = bytes else {
            return Ok(RowKey::new(vec![DataValue::Null; self.row.columns.len()]));
        };
        let Some(info) = self.window else {
            return Ok(RowKey::new(self.decode_values(bytes)?));
        };

        let tail = if info.window_type == WindowType::Session { 16 } else { 8 };
        if bytes.len() < tail {
            return Err(CodecError::WindowBounds);
        }
        let (inner, bounds) = bytes.split_at(bytes.len() - tail);
        let mut cursor = Cursor::new(bounds);
        let start = cursor.read_i64::<BigEndian>().map_err(|_| CodecError::WindowBounds)?;
        let end = match (info.window_type, info.size) {
            (WindowType::Session, _) => cursor.read_i64::<BigEndian>().map_err(|_| CodecError::WindowBounds)?,
            (_, Some(size)) => start + size,
            (_, None) => return Err(CodecError::WindowBounds),
        };
        Ok(RowKey::windowed(self.decode_values(inner)?, Window::new(start, end)))
    }

    fn decode_values(&self, bytes: &[u8]) -> Result<Vec<DataValue>> {
        if self.row.columns.is_empty() {
            Ok(Vec::new())
        } else {
            self.row.decode(bytes)
        }
    }
}
