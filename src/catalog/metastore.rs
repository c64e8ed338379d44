// Metastore
//
// Registry of the streams and tables known to the engine, and of which
// persistent queries read from or write to each of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use thiserror::Error;

use super::schema::LogicalSchema;
use crate::common::types::{DataSourceType, QueryId};
use crate::query::plan::{Formats, WindowInfo};
use crate::query::timestamp::TimestampColumn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetaStoreError {
    #[error("Cannot add {source_type} '{name}': a source with the same name already exists")]
    SourceAlreadyExists { name: String, source_type: DataSourceType },
    #[error("Source {0} does not exist")]
    SourceNotFound(String),
    #[error("Cannot drop {name}. The following queries {direction} this source: [{queries}]")]
    SourceInUse {
        name: String,
        direction: &'static str,
        queries: String,
    },
}

pub type Result<T> = std::result::Result<T, MetaStoreError>;

/// A registered stream or table
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub name: String,
    pub source_type: DataSourceType,
    pub schema: LogicalSchema,
    pub topic: String,
    pub formats: Formats,
    pub timestamp_column: Option<TimestampColumn>,
    /// Set when the backing topic holds windowed keys
    pub window_info: Option<WindowInfo>,
    /// Whether this source was created by a CSAS/CTAS statement
    pub is_query_sink: bool,
}

#[derive(Default)]
struct MetaStoreInner {
    sources: BTreeMap<String, Arc<DataSource>>,
    /// Source name -> queries writing into it
    sink_queries: HashMap<String, BTreeSet<QueryId>>,
    /// Source name -> queries reading from it
    source_queries: HashMap<String, BTreeSet<QueryId>>,
}

/// Thread-safe source catalog shared by the engine and its queries
#[derive(Default)]
pub struct MetaStore {
    inner: RwLock<MetaStoreInner>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source. `allow_replace` permits redefining an existing source.
    pub fn put_source(&self, source: DataSource, allow_replace: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if !allow_replace && inner.sources.contains_key(&source.name) {
            return Err(MetaStoreError::SourceAlreadyExists {
                name: source.name,
                source_type: source.source_type,
            });
        }
        debug!("Registering {} {}", source.source_type, source.name);
        inner.sources.insert(source.name.clone(), Arc::new(source));
        Ok(())
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<DataSource>> {
        self.inner.read().sources.get(name).cloned()
    }

    pub fn all_sources(&self) -> Vec<Arc<DataSource>> {
        self.inner.read().sources.values().cloned().collect()
    }

    /// Remove a source. Fails while any query still reads from or writes to it.
    pub fn delete_source(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.sources.contains_key(name) {
            return Err(MetaStoreError::SourceNotFound(name.to_string()));
        }
        for (direction, map) in [("read from", &inner.source_queries), ("write into", &inner.sink_queries)] {
            if let Some(queries) = map.get(name).filter(|q| !q.is_empty()) {
                let ids: Vec<String> = queries.iter().map(|q| q.to_string()).collect();
                return Err(MetaStoreError::SourceInUse {
                    name: name.to_string(),
                    direction,
                    queries: ids.join(", "),
                });
            }
        }
        inner.sources.remove(name);
        inner.source_queries.remove(name);
        inner.sink_queries.remove(name);
        debug!("Dropped source {}", name);
        Ok(())
    }

    /// Record that `query_id` reads `sources` and (optionally) writes `sink`
    pub fn add_query_references(&self, query_id: &QueryId, sources: &[String], sink: Option<&str>) {
        let mut inner = self.inner.write();
        for source in sources {
            inner
                .source_queries
                .entry(source.clone())
                .or_default()
                .insert(query_id.clone());
        }
        if let Some(sink) = sink {
            inner
                .sink_queries
                .entry(sink.to_string())
                .or_default()
                .insert(query_id.clone());
        }
    }

    pub fn remove_query_references(&self, query_id: &QueryId) {
        let mut inner = self.inner.write();
        for queries in inner.source_queries.values_mut() {
            queries.remove(query_id);
        }
        for queries in inner.sink_queries.values_mut() {
            queries.remove(query_id);
        }
    }

    pub fn queries_with_sink(&self, name: &str) -> Vec<QueryId> {
        self.inner
            .read()
            .sink_queries
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queries_with_source(&self, name: &str) -> Vec<QueryId> {
        self.inner
            .read()
            .source_queries
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}
