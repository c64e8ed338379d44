// Materialization Provider
//
// Read path over a running query's aggregation store. Lookups go to the
// runtime instance for the store on every call, so a query that is not
// running reports NotAvailable rather than an empty result.

use std::fmt;
use std::sync::Arc;

use crate::catalog::{DataValue, GenericRow, RowKey};
use crate::common::types::Timestamp;
use crate::runtime::{RunningInstance, RuntimeError, StoreView, StoredRow};

use super::{MaterializationError, MaterializationInfo, Result};

/// A materialized row as the query would emit it
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub key: RowKey,
    pub value: GenericRow,
    pub timestamp: Timestamp,
}

pub struct MaterializationProvider {
    info: MaterializationInfo,
    instance: Arc<dyn RunningInstance>,
}

impl fmt::Debug for MaterializationProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializationProvider")
            .field("store", &self.info.store_name())
            .field("windowed", &self.info.is_windowed())
            .finish()
    }
}

impl MaterializationProvider {
    pub fn new(info: MaterializationInfo, instance: Arc<dyn RunningInstance>) -> Self {
        MaterializationProvider { info, instance }
    }

    pub fn info(&self) -> &MaterializationInfo {
        &self.info
    }

    fn store(&self) -> Result<StoreView> {
        self.instance.store(self.info.store_name()).map_err(|e| match e {
            RuntimeError::StoreNotAvailable { .. } => MaterializationError::NotAvailable {
                store: self.info.store_name().to_string(),
                reason: e.to_string(),
            },
            other => MaterializationError::Runtime(other),
        })
    }

    fn mismatch(&self, expected: &'static str, actual: &'static str) -> MaterializationError {
        MaterializationError::WindowingMismatch {
            store: self.info.store_name().to_string(),
            expected,
            actual,
        }
    }

    fn to_row(&self, key: RowKey, stored: StoredRow) -> Option<TableRow> {
        let value = self.info.apply(&key, stored.timestamp, stored.value)?;
        Some(TableRow {
            key,
            value,
            timestamp: stored.timestamp,
        })
    }

    /// Point lookup in a non-windowed store. `Ok(None)` means the key is absent.
    pub fn get(&self, key: &[DataValue]) -> Result<Option<TableRow>> {
        match self.store()? {
            StoreView::KeyValue(store) => {
                let key = RowKey::new(key.to_vec());
                let stored = store.read().get(&key).cloned();
                Ok(stored.and_then(|s| self.to_row(key, s)))
            }
            StoreView::Windowed(_) => Err(self.mismatch("non-windowed", "windowed")),
        }
    }

    /// Lookup of the window starting at `window_start` in a windowed store
    pub fn get_window(&self, key: &[DataValue], window_start: Timestamp) -> Result<Option<TableRow>> {
        match self.store()? {
            StoreView::Windowed(store) => {
                let found = store.read().fetch_by_start(key, window_start);
                Ok(found.and_then(|(window, stored)| self.to_row(RowKey::windowed(key.to_vec(), window), stored)))
            }
            StoreView::KeyValue(_) => Err(self.mismatch("windowed", "non-windowed")),
        }
    }

    /// Every window of `key` whose start lies in `[lower, upper]`, ordered by start
    pub fn range(&self, key: &[DataValue], lower: Timestamp, upper: Timestamp) -> Result<Vec<TableRow>> {
        match self.store()? {
            StoreView::Windowed(store) => {
                let windows = store.read().fetch(key, lower, upper);
                Ok(windows
                    .into_iter()
                    .filter_map(|(window, stored)| self.to_row(RowKey::windowed(key.to_vec(), window), stored))
                    .collect())
            }
            StoreView::KeyValue(_) => Err(self.mismatch("windowed", "non-windowed")),
        }
    }
}
