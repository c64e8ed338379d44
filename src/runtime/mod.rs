//! Stream Runtime Interface
//!
//! The narrow set of capabilities the plan builder and the query lifecycle
//! manager need from a dataflow runtime: build a topology out of sources,
//! stateless transforms, keyed aggregations, joins and sinks, then run it
//! as an instance that can be started, inspected and closed.
//!
//! `local` provides an in-process implementation over the `broker` module.

pub mod broker;
pub mod local;
pub mod store;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Sender;
use serde_json::Value;
use thiserror::Error;

pub use self::broker::{BrokerRecord, InMemoryBroker};
pub use self::local::LocalRuntime;
pub use self::store::{KeyValueStore, StoreView, StoredRow, WindowStore};

use crate::catalog::{GenericRow, RowKey};
use crate::common::processing_log::ProcessingLogger;
use crate::common::types::Timestamp;
use crate::query::codec::{CodecError, KeyCodec, ValueCodec};
use crate::query::plan::{JoinType, WindowExpression};
use crate::query::timestamp::TimestampExtractor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Topology was not built by this runtime")]
    ForeignTopology,
    #[error("Unknown handle {0}")]
    UnknownHandle(usize),
    #[error("Instance is {0}, cannot {1}")]
    InvalidState(InstanceState, &'static str),
    #[error("State store {0} does not exist")]
    UnknownStore(String),
    #[error("State store {store} is not available: instance is {state}")]
    StoreNotAvailable { store: String, state: InstanceState },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);
    };
}

handle!(StreamHandle);
handle!(TableHandle);
handle!(GroupedStreamHandle);
handle!(GroupedTableHandle);

/// Key and event time of the record being processed
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub key: &'a RowKey,
    pub timestamp: Timestamp,
}

/// Maps a value. A `None` value is a tombstone.
pub type ValueMapper = Arc<dyn Fn(&RecordContext<'_>, Option<GenericRow>) -> Option<GenericRow> + Send + Sync>;
/// Keeps a record when it returns true
pub type RowPredicate = Arc<dyn Fn(&RecordContext<'_>, &GenericRow) -> bool + Send + Sync>;
/// Derives a new key for a record; `None` drops the record
pub type KeySelector = Arc<dyn Fn(&RecordContext<'_>, &GenericRow) -> Option<RowKey> + Send + Sync>;
pub type Initializer = Arc<dyn Fn() -> GenericRow + Send + Sync>;
/// Folds (or, for a subtractor, removes) a value into an aggregate
pub type Aggregator = Arc<dyn Fn(&RowKey, &GenericRow, GenericRow) -> GenericRow + Send + Sync>;
/// Merges two session aggregates into one
pub type Merger = Arc<dyn Fn(&RowKey, GenericRow, GenericRow) -> GenericRow + Send + Sync>;
/// Combines a stream value with the matching table value, if any
pub type ValueJoiner = Arc<dyn Fn(&RecordContext<'_>, &GenericRow, Option<&GenericRow>) -> GenericRow + Send + Sync>;
/// Called when an instance's worker fails
pub type UncaughtExceptionHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// How a source topic is read
#[derive(Clone)]
pub struct SourceSpec {
    pub topic: String,
    pub key_codec: KeyCodec,
    pub value_codec: ValueCodec,
    pub timestamp_extractor: TimestampExtractor,
}

/// How a stream is written to a topic
#[derive(Clone)]
pub struct SinkSpec {
    pub topic: String,
    pub key_codec: KeyCodec,
    pub value_codec: ValueCodec,
}

/// A row delivered to a transient query's queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub key: RowKey,
    pub value: Option<GenericRow>,
    pub timestamp: Timestamp,
}

/// Receives per-topic record counts
pub trait RecordCollector: Send + Sync {
    fn record_consumed(&self, topic: &str);
    fn record_produced(&self, topic: &str);
}

/// Settings and hooks handed to a new instance
#[derive(Clone)]
pub struct RuntimeProperties {
    pub values: BTreeMap<String, Value>,
    pub processing_logger: Arc<ProcessingLogger>,
    pub collectors: Vec<Arc<dyn RecordCollector>>,
}

impl fmt::Debug for RuntimeProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProperties")
            .field("values", &self.values)
            .field("processing_logger", &self.processing_logger.name())
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

/// A built, not yet running, dataflow
pub struct Topology {
    pub description: String,
    pub inner: Box<dyn Any + Send>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topology({})", self.description)
    }
}

/// Incrementally assembles a topology. Each call registers one stage.
pub trait TopologyBuilder {
    fn stream(&mut self, source: SourceSpec) -> Result<StreamHandle>;

    /// A table over a changelog topic, materialized in `store_name`
    fn table(&mut self, source: SourceSpec, store_name: &str) -> Result<TableHandle>;

    fn map_values(&mut self, stream: StreamHandle, mapper: ValueMapper) -> Result<StreamHandle>;

    fn filter(&mut self, stream: StreamHandle, predicate: RowPredicate) -> Result<StreamHandle>;

    /// Group a stream, optionally re-keying each record first
    fn group_stream(&mut self, stream: StreamHandle, selector: Option<KeySelector>) -> Result<GroupedStreamHandle>;

    fn map_table_values(&mut self, table: TableHandle, mapper: ValueMapper) -> Result<TableHandle>;

    fn filter_table(&mut self, table: TableHandle, predicate: RowPredicate) -> Result<TableHandle>;

    fn group_table(&mut self, table: TableHandle, selector: KeySelector) -> Result<GroupedTableHandle>;

    fn aggregate(
        &mut self,
        grouped: GroupedStreamHandle,
        initializer: Initializer,
        aggregator: Aggregator,
        store_name: &str,
    ) -> Result<TableHandle>;

    /// Windowed aggregation. `merger` is required for session windows.
    fn windowed_aggregate(
        &mut self,
        grouped: GroupedStreamHandle,
        window: WindowExpression,
        initializer: Initializer,
        aggregator: Aggregator,
        merger: Option<Merger>,
        store_name: &str,
    ) -> Result<TableHandle>;

    fn table_aggregate(
        &mut self,
        grouped: GroupedTableHandle,
        initializer: Initializer,
        adder: Aggregator,
        subtractor: Aggregator,
        store_name: &str,
    ) -> Result<TableHandle>;

    fn stream_table_join(
        &mut self,
        stream: StreamHandle,
        table: TableHandle,
        joiner: ValueJoiner,
        join_type: JoinType,
    ) -> Result<StreamHandle>;

    fn to_change_stream(&mut self, table: TableHandle) -> Result<StreamHandle>;

    fn sink_to(&mut self, stream: StreamHandle, sink: SinkSpec) -> Result<()>;

    /// Deliver rows to a channel, stopping after `limit` rows
    fn to_queue(&mut self, stream: StreamHandle, queue: Sender<QueueRow>, limit: Option<usize>) -> Result<()>;

    fn build(&mut self) -> Result<Topology>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    NotRunning,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Created => "CREATED",
            InstanceState::Running => "RUNNING",
            InstanceState::NotRunning => "NOT_RUNNING",
            InstanceState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// A topology bound to its properties
pub trait RunningInstance: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Stop processing. Blocks until the worker has exited.
    fn close(&self);

    fn set_uncaught_exception_handler(&self, handler: UncaughtExceptionHandler);

    fn state(&self) -> InstanceState;

    /// Read access to a named state store while the instance is running
    fn store(&self, name: &str) -> Result<StoreView>;
}

/// Creates topology builders and instances
pub trait StreamRuntime: Send + Sync {
    fn new_topology(&self) -> Box<dyn TopologyBuilder>;

    fn create_instance(&self, topology: Topology, properties: RuntimeProperties) -> Result<Arc<dyn RunningInstance>>;
}
