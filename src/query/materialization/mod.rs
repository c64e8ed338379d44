//! Materialization Module
//!
//! Describes how the state store behind an aggregation can be read as a
//! table: which store, the layout of what it holds, whether it is windowed,
//! and the chain of transforms that turns a stored aggregate record into the
//! row the query emits. The transforms are the same closures the pipeline
//! runs, so served rows always match pipeline output.

pub mod provider;

use std::fmt;

use thiserror::Error;

pub use self::provider::{MaterializationProvider, TableRow};

use crate::catalog::{GenericRow, LogicalSchema, RowKey};
use crate::common::types::{Timestamp, WindowType};
use crate::query::aggregate::params::ResultMapper;
use crate::query::aggregate::window_select::WindowSelectMapper;
use crate::runtime::{RecordContext, RowPredicate, RuntimeError, ValueMapper};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MaterializationError {
    /// The store exists but cannot serve reads here right now
    #[error("Materialized store {store} is not available: {reason}")]
    NotAvailable { store: String, reason: String },
    #[error("Store {store} is {actual}, lookup needs {expected}")]
    WindowingMismatch {
        store: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, MaterializationError>;

/// One step from stored record to visible row
#[derive(Clone)]
pub enum MaterializationTransform {
    /// Strip aggregate scratch columns
    AggregateMap(ResultMapper),
    /// Fill WINDOWSTART / WINDOWEND from the key's window
    WindowSelect(WindowSelectMapper),
    /// A projection applied after aggregation
    Project(ValueMapper),
    /// A HAVING-style filter applied after aggregation
    Filter(RowPredicate),
}

impl MaterializationTransform {
    fn name(&self) -> &'static str {
        match self {
            MaterializationTransform::AggregateMap(_) => "AggregateMap",
            MaterializationTransform::WindowSelect(_) => "WindowSelect",
            MaterializationTransform::Project(_) => "Project",
            MaterializationTransform::Filter(_) => "Filter",
        }
    }

    /// `None` means the row is filtered out
    fn apply(&self, key: &RowKey, timestamp: Timestamp, row: GenericRow) -> Option<GenericRow> {
        let ctx = RecordContext { key, timestamp };
        match self {
            MaterializationTransform::AggregateMap(mapper) => Some(mapper(&row)),
            MaterializationTransform::WindowSelect(mapper) => Some(mapper.apply(key.window(), row)),
            MaterializationTransform::Project(mapper) => mapper(&ctx, Some(row)),
            MaterializationTransform::Filter(predicate) => predicate(&ctx, &row).then_some(row),
        }
    }
}

impl fmt::Debug for MaterializationTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable description of a queryable aggregation store
#[derive(Debug, Clone)]
pub struct MaterializationInfo {
    store_name: String,
    /// Layout of the records held in the store
    state_schema: LogicalSchema,
    /// Layout of rows after every transform
    schema: LogicalSchema,
    window_type: Option<WindowType>,
    transforms: Vec<MaterializationTransform>,
}

impl MaterializationInfo {
    pub fn builder(store_name: impl Into<String>, state_schema: LogicalSchema, window_type: Option<WindowType>) -> MaterializationInfoBuilder {
        MaterializationInfoBuilder {
            store_name: store_name.into(),
            schema: state_schema.clone(),
            state_schema,
            window_type,
            transforms: Vec::new(),
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn state_schema(&self) -> &LogicalSchema {
        &self.state_schema
    }

    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    pub fn window_type(&self) -> Option<WindowType> {
        self.window_type
    }

    pub fn is_windowed(&self) -> bool {
        self.window_type.is_some()
    }

    pub fn transforms(&self) -> &[MaterializationTransform] {
        &self.transforms
    }

    /// Run a stored record through every transform in order
    pub fn apply(&self, key: &RowKey, timestamp: Timestamp, stored: GenericRow) -> Option<GenericRow> {
        self.transforms
            .iter()
            .try_fold(stored, |row, transform| transform.apply(key, timestamp, row))
    }
}

/// Accumulates transforms as the plan builder walks up from the aggregation
#[derive(Debug, Clone)]
pub struct MaterializationInfoBuilder {
    store_name: String,
    state_schema: LogicalSchema,
    schema: LogicalSchema,
    window_type: Option<WindowType>,
    transforms: Vec<MaterializationTransform>,
}

impl MaterializationInfoBuilder {
    pub fn map(mut self, mapper: ResultMapper, schema: LogicalSchema) -> Self {
        self.transforms.push(MaterializationTransform::AggregateMap(mapper));
        self.schema = schema;
        self
    }

    pub fn window_select(mut self, mapper: WindowSelectMapper) -> Self {
        self.transforms.push(MaterializationTransform::WindowSelect(mapper));
        self
    }

    pub fn project(mut self, mapper: ValueMapper, schema: LogicalSchema) -> Self {
        self.transforms.push(MaterializationTransform::Project(mapper));
        self.schema = schema;
        self
    }

    pub fn filter(mut self, predicate: RowPredicate) -> Self {
        self.transforms.push(MaterializationTransform::Filter(predicate));
        self
    }

    pub fn build(self) -> MaterializationInfo {
        MaterializationInfo {
            store_name: self.store_name,
            state_schema: self.state_schema,
            schema: self.schema,
            window_type: self.window_type,
            transforms: self.transforms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{DataValue, SqlType};
    use crate::common::types::Window;
    use crate::query::aggregate::function::AggregateFunction;

    fn schema() -> LogicalSchema {
        LogicalSchema::builder()
            .key_column("K", SqlType::String)
            .value_column("V", SqlType::BigInt)
            .build()
            .unwrap()
    }

    #[test]
    fn test_transforms_run_in_order() {
        let doubled: ResultMapper = Arc::new(|row: &GenericRow| {
            GenericRow::new(row.values().iter().map(|v| DataValue::Integer(v.as_i64().unwrap_or(0) * 2)).collect())
        });
        let positive: RowPredicate = Arc::new(|_: &RecordContext<'_>, row: &GenericRow| row.get(0).and_then(|v| v.as_i64()).unwrap_or(0) > 2);
        let info = MaterializationInfo::builder("Aggregate-Materialize", schema(), None)
            .map(doubled, schema())
            .filter(positive)
            .build();

        let key = RowKey::new(vec![DataValue::Text("a".into())]);
        assert_eq!(
            info.apply(&key, 0, GenericRow::new(vec![DataValue::Integer(2)])),
            Some(GenericRow::new(vec![DataValue::Integer(4)]))
        );
        assert_eq!(info.apply(&key, 0, GenericRow::new(vec![DataValue::Integer(1)])), None);
        assert_eq!(format!("{:?}", info.transforms()), "[AggregateMap, Filter]");
    }

    #[test]
    fn test_window_select_reads_key_window() {
        let info = MaterializationInfo::builder("store", schema(), Some(WindowType::Tumbling))
            .window_select(WindowSelectMapper::new(0, &[AggregateFunction::WindowEnd]))
            .build();
        let key = RowKey::windowed(vec![DataValue::Text("a".into())], Window::new(0, 10));
        let row = info.apply(&key, 3, GenericRow::new(vec![DataValue::Null])).unwrap();
        assert_eq!(row.get(0), Some(&DataValue::Integer(10)));
        assert!(info.is_windowed());
    }
}
