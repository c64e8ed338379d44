// State Stores
//
// In-memory key-value and windowed stores backing aggregations and tables.
// Stores are shared between the worker that writes them and readers that
// serve materialized lookups, so each lives behind a parking_lot RwLock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::{DataValue, GenericRow, RowKey};
use crate::common::types::{Timestamp, Window, WindowType};

/// A stored value and the event time of its last update
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub value: GenericRow,
    pub timestamp: Timestamp,
}

#[derive(Debug, Default)]
pub struct KeyValueStore {
    rows: HashMap<RowKey, StoredRow>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RowKey) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    /// Insert or replace; returns the previous row
    pub fn put(&mut self, key: RowKey, row: StoredRow) -> Option<StoredRow> {
        self.rows.insert(key, row)
    }

    pub fn delete(&mut self, key: &RowKey) -> Option<StoredRow> {
        self.rows.remove(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &StoredRow)> {
        self.rows.iter()
    }
}

/// Rows keyed by key values, then by window
#[derive(Debug)]
pub struct WindowStore {
    window_type: WindowType,
    rows: HashMap<Vec<DataValue>, BTreeMap<Window, StoredRow>>,
}

impl WindowStore {
    pub fn new(window_type: WindowType) -> Self {
        WindowStore {
            window_type,
            rows: HashMap::new(),
        }
    }

    pub fn window_type(&self) -> WindowType {
        self.window_type
    }

    pub fn get(&self, key: &[DataValue], window: &Window) -> Option<&StoredRow> {
        self.rows.get(key).and_then(|w| w.get(window))
    }

    pub fn put(&mut self, key: Vec<DataValue>, window: Window, row: StoredRow) -> Option<StoredRow> {
        self.rows.entry(key).or_default().insert(window, row)
    }

    pub fn remove(&mut self, key: &[DataValue], window: &Window) -> Option<StoredRow> {
        let windows = self.rows.get_mut(key)?;
        let removed = windows.remove(window);
        if windows.is_empty() {
            self.rows.remove(key);
        }
        removed
    }

    /// Every window held for a key, ordered by start
    pub fn windows(&self, key: &[DataValue]) -> Vec<(Window, StoredRow)> {
        self.rows
            .get(key)
            .map(|w| w.iter().map(|(win, row)| (*win, row.clone())).collect())
            .unwrap_or_default()
    }

    /// Windows for a key whose start lies in `[lower, upper]`
    pub fn fetch(&self, key: &[DataValue], lower: Timestamp, upper: Timestamp) -> Vec<(Window, StoredRow)> {
        self.windows(key)
            .into_iter()
            .filter(|(w, _)| w.start >= lower && w.start <= upper)
            .collect()
    }

    /// Window whose start equals `start`, if any
    pub fn fetch_by_start(&self, key: &[DataValue], start: Timestamp) -> Option<(Window, StoredRow)> {
        self.windows(key).into_iter().find(|(w, _)| w.start == start)
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read handle on a named store
#[derive(Debug, Clone)]
pub enum StoreView {
    KeyValue(Arc<RwLock<KeyValueStore>>),
    Windowed(Arc<RwLock<WindowStore>>),
}
