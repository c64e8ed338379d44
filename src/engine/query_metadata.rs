// Query Metadata
//
// The runnable unit behind a started statement. Start and close are both
// idempotent; close stops the runtime instance and then runs the close
// callback, exactly once, however many times it is called.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::info;
use parking_lot::Mutex;
use serde_json::Value;

use crate::catalog::LogicalSchema;
use crate::common::types::{DataSourceType, QueryId};
use crate::query::materialization::provider::MaterializationProvider;
use crate::runtime::{InstanceState, QueueRow, RunningInstance, RuntimeError};

/// Invoked once when a query is closed
pub type QueryCloseCallback = Arc<dyn Fn(&QueryId) + Send + Sync>;

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    closed: bool,
}

/// State shared by persistent and transient queries
pub struct QueryMetadata {
    query_id: QueryId,
    statement_text: String,
    schema: LogicalSchema,
    sources: Vec<String>,
    application_id: String,
    plan_summary: String,
    topology_description: String,
    properties: BTreeMap<String, Value>,
    overrides: BTreeMap<String, Value>,
    instance: Arc<dyn RunningInstance>,
    on_close: QueryCloseCallback,
    lifecycle: Mutex<Lifecycle>,
}

/// Construction parameters of a QueryMetadata
pub struct QueryMetadataParts {
    pub query_id: QueryId,
    pub statement_text: String,
    pub schema: LogicalSchema,
    pub sources: Vec<String>,
    pub application_id: String,
    pub plan_summary: String,
    pub topology_description: String,
    pub properties: BTreeMap<String, Value>,
    pub overrides: BTreeMap<String, Value>,
    pub instance: Arc<dyn RunningInstance>,
    pub on_close: QueryCloseCallback,
}

impl QueryMetadata {
    pub fn new(parts: QueryMetadataParts) -> Self {
        QueryMetadata {
            query_id: parts.query_id,
            statement_text: parts.statement_text,
            schema: parts.schema,
            sources: parts.sources,
            application_id: parts.application_id,
            plan_summary: parts.plan_summary,
            topology_description: parts.topology_description,
            properties: parts.properties,
            overrides: parts.overrides,
            instance: parts.instance,
            on_close: parts.on_close,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn statement_text(&self) -> &str {
        &self.statement_text
    }

    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn plan_summary(&self) -> &str {
        &self.plan_summary
    }

    pub fn topology_description(&self) -> &str {
        &self.topology_description
    }

    /// Runtime properties the instance was created with
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn overrides(&self) -> &BTreeMap<String, Value> {
        &self.overrides
    }

    pub fn state(&self) -> InstanceState {
        self.instance.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    /// Start processing. Starting a started query does nothing.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return Err(RuntimeError::InvalidState(self.instance.state(), "start a closed query"));
        }
        if lifecycle.started {
            return Ok(());
        }
        self.instance.start()?;
        lifecycle.started = true;
        info!("Started query {} as {}", self.query_id, self.application_id);
        Ok(())
    }

    /// Stop processing and release the query. Blocks until the instance has stopped.
    pub fn close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
        }
        self.instance.close();
        info!("Closed query {}", self.query_id);
        (self.on_close)(&self.query_id);
    }
}

impl fmt::Debug for QueryMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryMetadata")
            .field("query_id", &self.query_id)
            .field("application_id", &self.application_id)
            .field("state", &self.state())
            .finish()
    }
}

/// A query writing into a sink source, registered with the engine
#[derive(Debug)]
pub struct PersistentQueryMetadata {
    metadata: QueryMetadata,
    sink_name: String,
    sink_type: DataSourceType,
    materialization: Option<MaterializationProvider>,
}

impl PersistentQueryMetadata {
    pub fn new(
        metadata: QueryMetadata,
        sink_name: String,
        sink_type: DataSourceType,
        materialization: Option<MaterializationProvider>,
    ) -> Self {
        PersistentQueryMetadata {
            metadata,
            sink_name,
            sink_type,
            materialization,
        }
    }

    pub fn metadata(&self) -> &QueryMetadata {
        &self.metadata
    }

    pub fn query_id(&self) -> &QueryId {
        self.metadata.query_id()
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    pub fn sink_type(&self) -> DataSourceType {
        self.sink_type
    }

    /// Read path over the query's aggregation, when it has one
    pub fn materialization(&self) -> Option<&MaterializationProvider> {
        self.materialization.as_ref()
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.metadata.start()
    }

    pub fn close(&self) {
        self.metadata.close()
    }

    pub fn state(&self) -> InstanceState {
        self.metadata.state()
    }
}

/// An ad-hoc query delivering its rows to a queue
#[derive(Debug)]
pub struct TransientQueryMetadata {
    metadata: QueryMetadata,
    rows: Receiver<QueueRow>,
    limit: Option<usize>,
}

impl TransientQueryMetadata {
    pub fn new(metadata: QueryMetadata, rows: Receiver<QueueRow>, limit: Option<usize>) -> Self {
        TransientQueryMetadata { metadata, rows, limit }
    }

    pub fn metadata(&self) -> &QueryMetadata {
        &self.metadata
    }

    pub fn query_id(&self) -> &QueryId {
        self.metadata.query_id()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn rows(&self) -> &Receiver<QueueRow> {
        &self.rows
    }

    /// Wait up to `timeout` for the next row; `None` on timeout or once the query stopped
    pub fn next_row(&self, timeout: Duration) -> Option<QueueRow> {
        match self.rows.recv_timeout(timeout) {
            Ok(row) => Some(row),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.metadata.start()
    }

    pub fn close(&self) {
        self.metadata.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::SqlType;
    use crate::runtime::{StoreView, UncaughtExceptionHandler};

    #[derive(Default)]
    struct CountingInstance {
        starts: AtomicUsize,
        closes: AtomicUsize,
    }

    impl RunningInstance for CountingInstance {
        fn start(&self) -> Result<(), RuntimeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn set_uncaught_exception_handler(&self, _handler: UncaughtExceptionHandler) {}

        fn state(&self) -> InstanceState {
            InstanceState::Running
        }

        fn store(&self, name: &str) -> Result<StoreView, RuntimeError> {
            Err(RuntimeError::UnknownStore(name.to_string()))
        }
    }

    fn metadata(instance: Arc<CountingInstance>, closed: Arc<AtomicUsize>) -> QueryMetadata {
        QueryMetadata::new(QueryMetadataParts {
            query_id: QueryId::new("CSAS_OUT_0"),
            statement_text: "{}".into(),
            schema: LogicalSchema::builder().value_column("V", SqlType::BigInt).build().unwrap(),
            sources: vec!["IN".into()],
            application_id: "app".into(),
            plan_summary: String::new(),
            topology_description: String::new(),
            properties: BTreeMap::new(),
            overrides: BTreeMap::new(),
            instance,
            on_close: Arc::new(move |_: &QueryId| {
                closed.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }

    #[test]
    fn test_start_and_close_are_idempotent() {
        let instance = Arc::new(CountingInstance::default());
        let closed = Arc::new(AtomicUsize::new(0));
        let query = metadata(instance.clone(), closed.clone());

        query.start().unwrap();
        query.start().unwrap();
        assert_eq!(instance.starts.load(Ordering::SeqCst), 1);

        query.close();
        query.close();
        assert_eq!(instance.closes.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(query.is_closed());
        assert!(query.start().is_err());
    }
}
