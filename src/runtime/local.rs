// Local Runtime
//
// In-process implementation of the runtime interface. A topology is a graph
// of nodes; every record read from a source topic becomes a change
// (key, old value, new value, timestamp) that is pushed depth-first through
// the node's descendants. Stream changes never carry an old value. Table
// changes carry both, so downstream aggregations can retract what they
// previously added.
//
// Each started instance owns one worker thread. The worker reads its
// subscription and a shutdown channel with crossbeam's select; on shutdown
// it drains what was already delivered and exits.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use super::broker::{BrokerRecord, InMemoryBroker, SubscriptionId};
use super::store::{KeyValueStore, StoreView, StoredRow, WindowStore};
use super::{
    Aggregator, GroupedStreamHandle, GroupedTableHandle, Initializer, InstanceState, KeySelector, Merger, QueueRow,
    RecordCollector, RecordContext, Result, RowPredicate, RunningInstance, RuntimeError, RuntimeProperties, SinkSpec,
    SourceSpec, StreamHandle, StreamRuntime, TableHandle, Topology, TopologyBuilder, UncaughtExceptionHandler,
    ValueJoiner, ValueMapper,
};
use crate::catalog::{GenericRow, RowKey};
use crate::common::config::APPLICATION_ID_CONFIG;
use crate::common::processing_log::ProcessingLogger;
use crate::common::types::Timestamp;
use crate::query::aggregate::window::{session_window_for, time_windows_for};
use crate::query::plan::{JoinType, WindowExpression};

/// One update flowing through the graph
#[derive(Debug, Clone, PartialEq)]
struct Change {
    key: RowKey,
    old: Option<GenericRow>,
    new: Option<GenericRow>,
    timestamp: Timestamp,
}

impl Change {
    fn stream(key: RowKey, value: Option<GenericRow>, timestamp: Timestamp) -> Self {
        Change {
            key,
            old: None,
            new: value,
            timestamp,
        }
    }

    fn is_empty(&self) -> bool {
        self.old.is_none() && self.new.is_none()
    }
}

enum NodeKind {
    Source {
        spec: SourceSpec,
        /// Set for table sources, which keep their latest values
        store: Option<Arc<RwLock<KeyValueStore>>>,
    },
    MapValues(ValueMapper),
    Filter(RowPredicate),
    SelectKey(Option<KeySelector>),
    MapTableValues(ValueMapper),
    FilterTable(RowPredicate),
    GroupTable(KeySelector),
    Aggregate {
        initializer: Initializer,
        aggregator: Aggregator,
        store: Arc<RwLock<KeyValueStore>>,
    },
    WindowedAggregate {
        window: WindowExpression,
        initializer: Initializer,
        aggregator: Aggregator,
        merger: Option<Merger>,
        store: Arc<RwLock<WindowStore>>,
    },
    TableAggregate {
        initializer: Initializer,
        adder: Aggregator,
        subtractor: Aggregator,
        store: Arc<RwLock<KeyValueStore>>,
    },
    /// Latest value per key of a table, read by joins
    Materialize(Arc<RwLock<KeyValueStore>>),
    Join {
        table: Arc<RwLock<KeyValueStore>>,
        joiner: ValueJoiner,
        join_type: JoinType,
    },
    ToStream,
    Sink(SinkSpec),
    Queue {
        sender: Sender<QueueRow>,
        limit: Option<usize>,
        delivered: usize,
    },
}

impl NodeKind {
    fn name(&self) -> &'static str {
        match self {
            NodeKind::Source { store: None, .. } => "StreamSource",
            NodeKind::Source { store: Some(_), .. } => "TableSource",
            NodeKind::MapValues(_) => "MapValues",
            NodeKind::Filter(_) => "Filter",
            NodeKind::SelectKey(_) => "GroupBy",
            NodeKind::MapTableValues(_) => "MapTableValues",
            NodeKind::FilterTable(_) => "FilterTable",
            NodeKind::GroupTable(_) => "GroupTable",
            NodeKind::Aggregate { .. } => "Aggregate",
            NodeKind::WindowedAggregate { .. } => "WindowedAggregate",
            NodeKind::TableAggregate { .. } => "TableAggregate",
            NodeKind::Materialize(_) => "Materialize",
            NodeKind::Join { .. } => "Join",
            NodeKind::ToStream => "ToStream",
            NodeKind::Sink(_) => "Sink",
            NodeKind::Queue { .. } => "Queue",
        }
    }
}

struct Node {
    kind: NodeKind,
    children: Vec<usize>,
}

/// What a node may touch besides its own state
struct Env<'a> {
    broker: &'a InMemoryBroker,
    logger: &'a ProcessingLogger,
    collectors: &'a [Arc<dyn RecordCollector>],
}

/// A built graph, ready to be bound to an instance
struct LocalTopology {
    nodes: Vec<Node>,
    /// Node indexes of sources
    sources: Vec<usize>,
    stores: HashMap<String, StoreView>,
}

impl LocalTopology {
    /// Topics to subscribe to. Table topics come first so tables are
    /// loaded before the streams that join against them.
    fn source_topics(&self) -> Vec<String> {
        let mut tables = Vec::new();
        let mut streams = Vec::new();
        for &idx in &self.sources {
            if let NodeKind::Source { spec, store } = &self.nodes[idx].kind {
                let target = if store.is_some() { &mut tables } else { &mut streams };
                if !target.contains(&spec.topic) {
                    target.push(spec.topic.clone());
                }
            }
        }
        for topic in streams {
            if !tables.contains(&topic) {
                tables.push(topic);
            }
        }
        tables
    }

    fn on_record(&mut self, env: &Env<'_>, record: &BrokerRecord) {
        for c in env.collectors {
            c.record_consumed(&record.topic);
        }
        for idx in self.sources.clone() {
            let change = match &self.nodes[idx].kind {
                NodeKind::Source { spec, store } if spec.topic == record.topic => decode(env, spec, store.as_ref(), record),
                _ => continue,
            };
            if let Some(change) = change {
                self.emit(env, idx, change);
            }
        }
    }

    fn emit(&mut self, env: &Env<'_>, from: usize, change: Change) {
        let children = self.nodes[from].children.clone();
        for child in children {
            self.forward(env, child, change.clone());
        }
    }

    fn forward(&mut self, env: &Env<'_>, idx: usize, change: Change) {
        for output in apply(env, &mut self.nodes[idx].kind, change) {
            self.emit(env, idx, output);
        }
    }
}

fn render(bytes: Option<&[u8]>) -> Option<String> {
    bytes.map(hex::encode)
}

/// Turn a source record into the first change of the graph
fn decode(
    env: &Env<'_>,
    spec: &SourceSpec,
    store: Option<&Arc<RwLock<KeyValueStore>>>,
    record: &BrokerRecord,
) -> Option<Change> {
    let key = match spec.key_codec.deserialize(record.key.as_deref()) {
        Ok(key) => key,
        Err(e) => {
            env.logger.error(
                format!("Failed to deserialize key from topic {}: {}", record.topic, e),
                render(record.key.as_deref()),
            );
            return None;
        }
    };
    let value = match spec.value_codec.deserialize(record.value.as_deref()) {
        Ok(value) => value,
        Err(e) => {
            env.logger.error(
                format!("Failed to deserialize value from topic {}: {}", record.topic, e),
                render(record.value.as_deref()),
            );
            return None;
        }
    };
    let timestamp = match &value {
        Some(row) => match spec.timestamp_extractor.extract(record.timestamp, row) {
            Ok(ts) => ts,
            Err(e) => {
                env.logger.error(
                    format!("Failed to extract timestamp from topic {}: {}", record.topic, e),
                    Some(row.to_string()),
                );
                return None;
            }
        },
        None => record.timestamp,
    };

    let Some(store) = store else {
        return Some(Change::stream(key, value, timestamp));
    };
    let mut store = store.write();
    let old = match &value {
        Some(row) => store.put(
            key.clone(),
            StoredRow {
                value: row.clone(),
                timestamp,
            },
        ),
        None => store.delete(&key),
    };
    let change = Change {
        key,
        old: old.map(|s| s.value),
        new: value,
        timestamp,
    };
    (!change.is_empty()).then_some(change)
}

fn apply(env: &Env<'_>, kind: &mut NodeKind, change: Change) -> Vec<Change> {
    let ctx = RecordContext {
        key: &change.key,
        timestamp: change.timestamp,
    };
    match kind {
        NodeKind::Source { .. } => vec![change],
        NodeKind::MapValues(mapper) => {
            let new = mapper(&ctx, change.new.clone());
            vec![Change::stream(change.key.clone(), new, change.timestamp)]
        }
        NodeKind::Filter(predicate) => {
            let keep = change.new.as_ref().is_some_and(|row| predicate(&ctx, row));
            if keep { vec![change] } else { Vec::new() }
        }
        NodeKind::SelectKey(None) => vec![change],
        NodeKind::SelectKey(Some(selector)) => {
            let Some(row) = &change.new else {
                return Vec::new();
            };
            match selector(&ctx, row) {
                Some(key) => vec![Change::stream(key, change.new.clone(), change.timestamp)],
                None => Vec::new(),
            }
        }
        NodeKind::MapTableValues(mapper) => {
            let old = change.old.clone().and_then(|o| mapper(&ctx, Some(o)));
            let new = mapper(&ctx, change.new.clone());
            table_change(change.key.clone(), old, new, change.timestamp)
        }
        NodeKind::FilterTable(predicate) => {
            let old = change.old.clone().filter(|o| predicate(&ctx, o));
            let new = change.new.clone().filter(|n| predicate(&ctx, n));
            table_change(change.key.clone(), old, new, change.timestamp)
        }
        NodeKind::GroupTable(selector) => {
            // retract under the old key before adding under the new one
            let mut out = Vec::with_capacity(2);
            if let Some(old) = &change.old {
                if let Some(key) = selector(&ctx, old) {
                    out.push(Change {
                        key,
                        old: Some(old.clone()),
                        new: None,
                        timestamp: change.timestamp,
                    });
                }
            }
            if let Some(new) = &change.new {
                if let Some(key) = selector(&ctx, new) {
                    out.push(Change {
                        key,
                        old: None,
                        new: Some(new.clone()),
                        timestamp: change.timestamp,
                    });
                }
            }
            out
        }
        NodeKind::Aggregate {
            initializer,
            aggregator,
            store,
        } => {
            let Some(row) = &change.new else {
                return Vec::new();
            };
            let mut store = store.write();
            let previous = store.get(&change.key).map(|s| s.value.clone());
            let next = aggregator(&change.key, row, previous.clone().unwrap_or_else(|| initializer()));
            store.put(
                change.key.clone(),
                StoredRow {
                    value: next.clone(),
                    timestamp: change.timestamp,
                },
            );
            vec![Change {
                key: change.key.clone(),
                old: previous,
                new: Some(next),
                timestamp: change.timestamp,
            }]
        }
        NodeKind::TableAggregate {
            initializer,
            adder,
            subtractor,
            store,
        } => {
            let mut store = store.write();
            let previous = store.get(&change.key).map(|s| s.value.clone());
            let mut current = previous.clone().unwrap_or_else(|| initializer());
            if let Some(old) = &change.old {
                current = subtractor(&change.key, old, current);
            }
            if let Some(new) = &change.new {
                current = adder(&change.key, new, current);
            }
            store.put(
                change.key.clone(),
                StoredRow {
                    value: current.clone(),
                    timestamp: change.timestamp,
                },
            );
            vec![Change {
                key: change.key.clone(),
                old: previous,
                new: Some(current),
                timestamp: change.timestamp,
            }]
        }
        NodeKind::WindowedAggregate {
            window,
            initializer,
            aggregator,
            merger,
            store,
        } => {
            let Some(row) = &change.new else {
                return Vec::new();
            };
            let mut store = store.write();
            let key_values = change.key.values().to_vec();
            match (*window, merger.as_ref()) {
                (WindowExpression::Session { gap }, Some(merger)) => {
                    let existing: Vec<_> = store.windows(&key_values);
                    let windows: Vec<_> = existing.iter().map(|(w, _)| *w).collect();
                    let assignment = session_window_for(&windows, change.timestamp, gap);

                    let mut out = Vec::new();
                    let mut aggregate = initializer();
                    let mut previous = None;
                    let mut timestamp = change.timestamp;
                    for merged in &assignment.merged {
                        let Some(stored) = store.remove(&key_values, merged) else {
                            continue;
                        };
                        timestamp = timestamp.max(stored.timestamp);
                        aggregate = merger(&change.key, stored.value.clone(), aggregate);
                        if *merged == assignment.window {
                            previous = Some(stored.value);
                        } else {
                            out.push(Change {
                                key: change.key.with_window(Some(*merged)),
                                old: Some(stored.value),
                                new: None,
                                timestamp: change.timestamp,
                            });
                        }
                    }
                    let next = aggregator(&change.key, row, aggregate);
                    store.put(
                        key_values,
                        assignment.window,
                        StoredRow {
                            value: next.clone(),
                            timestamp,
                        },
                    );
                    out.push(Change {
                        key: change.key.with_window(Some(assignment.window)),
                        old: previous,
                        new: Some(next),
                        timestamp: change.timestamp,
                    });
                    out
                }
                _ => time_windows_for(window, change.timestamp)
                    .into_iter()
                    .map(|w| {
                        let previous = store.get(&key_values, &w).map(|s| s.value.clone());
                        let next = aggregator(&change.key, row, previous.clone().unwrap_or_else(|| initializer()));
                        store.put(
                            key_values.clone(),
                            w,
                            StoredRow {
                                value: next.clone(),
                                timestamp: change.timestamp,
                            },
                        );
                        Change {
                            key: change.key.with_window(Some(w)),
                            old: previous,
                            new: Some(next),
                            timestamp: change.timestamp,
                        }
                    })
                    .collect(),
            }
        }
        NodeKind::Materialize(store) => {
            let mut store = store.write();
            match &change.new {
                Some(row) => {
                    store.put(
                        change.key.with_window(None),
                        StoredRow {
                            value: row.clone(),
                            timestamp: change.timestamp,
                        },
                    );
                }
                None => {
                    store.delete(&change.key.with_window(None));
                }
            }
            Vec::new()
        }
        NodeKind::Join {
            table,
            joiner,
            join_type,
        } => {
            let Some(left) = &change.new else {
                return Vec::new();
            };
            let table = table.read();
            let right = table.get(&change.key.with_window(None)).map(|s| &s.value);
            if right.is_none() && *join_type == JoinType::Inner {
                return Vec::new();
            }
            let joined = joiner(&ctx, left, right);
            vec![Change::stream(change.key.clone(), Some(joined), change.timestamp)]
        }
        NodeKind::ToStream => vec![Change::stream(change.key.clone(), change.new.clone(), change.timestamp)],
        NodeKind::Sink(spec) => {
            produce(env, spec, &change);
            Vec::new()
        }
        NodeKind::Queue {
            sender,
            limit,
            delivered,
        } => {
            if limit.map_or(false, |l| *delivered >= l) {
                return Vec::new();
            }
            // a dropped receiver means the transient query was closed
            if sender
                .send(QueueRow {
                    key: change.key.clone(),
                    value: change.new.clone(),
                    timestamp: change.timestamp,
                })
                .is_ok()
            {
                *delivered += 1;
            }
            Vec::new()
        }
    }
}

fn table_change(key: RowKey, old: Option<GenericRow>, new: Option<GenericRow>, timestamp: Timestamp) -> Vec<Change> {
    let change = Change {
        key,
        old,
        new,
        timestamp,
    };
    if change.is_empty() {
        Vec::new()
    } else {
        vec![change]
    }
}

fn produce(env: &Env<'_>, spec: &SinkSpec, change: &Change) {
    let key = match spec.key_codec.serialize(&change.key) {
        Ok(key) => key,
        Err(e) => {
            env.logger.error(
                format!("Failed to serialize key for topic {}: {}", spec.topic, e),
                Some(change.key.to_string()),
            );
            return;
        }
    };
    let value = match spec.value_codec.serialize(change.new.as_ref()) {
        Ok(value) => value,
        Err(e) => {
            env.logger.error(
                format!("Failed to serialize value for topic {}: {}", spec.topic, e),
                change.new.as_ref().map(|r| r.to_string()),
            );
            return;
        }
    };
    env.broker.produce(&spec.topic, key, value, change.timestamp);
    for c in env.collectors {
        c.record_produced(&spec.topic);
    }
}

/// Assembles a LocalTopology
#[derive(Default)]
pub struct LocalTopologyBuilder {
    nodes: Vec<Node>,
    sources: Vec<usize>,
    stores: HashMap<String, StoreView>,
}

impl LocalTopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, idx: usize) -> Result<()> {
        if idx < self.nodes.len() {
            Ok(())
        } else {
            Err(RuntimeError::UnknownHandle(idx))
        }
    }

    fn add(&mut self, parent: Option<usize>, kind: NodeKind) -> Result<usize> {
        if let Some(parent) = parent {
            self.check(parent)?;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(idx);
        }
        Ok(idx)
    }

    fn kv_store(&mut self, name: &str) -> Arc<RwLock<KeyValueStore>> {
        let store = Arc::new(RwLock::new(KeyValueStore::new()));
        self.stores.insert(name.to_string(), StoreView::KeyValue(store.clone()));
        store
    }

    fn describe(&self, idx: usize, depth: usize, out: &mut String) {
        let node = &self.nodes[idx];
        out.push_str(&format!("{}{}-{}\n", "  ".repeat(depth), node.kind.name(), idx));
        for &child in &node.children {
            self.describe(child, depth + 1, out);
        }
    }
}

impl TopologyBuilder for LocalTopologyBuilder {
    fn stream(&mut self, source: SourceSpec) -> Result<StreamHandle> {
        let idx = self.add(None, NodeKind::Source { spec: source, store: None })?;
        self.sources.push(idx);
        Ok(StreamHandle(idx))
    }

    fn table(&mut self, source: SourceSpec, store_name: &str) -> Result<TableHandle> {
        let store = self.kv_store(store_name);
        let idx = self.add(
            None,
            NodeKind::Source {
                spec: source,
                store: Some(store),
            },
        )?;
        self.sources.push(idx);
        Ok(TableHandle(idx))
    }

    fn map_values(&mut self, stream: StreamHandle, mapper: ValueMapper) -> Result<StreamHandle> {
        self.add(Some(stream.0), NodeKind::MapValues(mapper)).map(StreamHandle)
    }

    fn filter(&mut self, stream: StreamHandle, predicate: RowPredicate) -> Result<StreamHandle> {
        self.add(Some(stream.0), NodeKind::Filter(predicate)).map(StreamHandle)
    }

    fn group_stream(&mut self, stream: StreamHandle, selector: Option<KeySelector>) -> Result<GroupedStreamHandle> {
        self.add(Some(stream.0), NodeKind::SelectKey(selector)).map(GroupedStreamHandle)
    }

    fn map_table_values(&mut self, table: TableHandle, mapper: ValueMapper) -> Result<TableHandle> {
        self.add(Some(table.0), NodeKind::MapTableValues(mapper)).map(TableHandle)
    }

    fn filter_table(&mut self, table: TableHandle, predicate: RowPredicate) -> Result<TableHandle> {
        self.add(Some(table.0), NodeKind::FilterTable(predicate)).map(TableHandle)
    }

    fn group_table(&mut self, table: TableHandle, selector: KeySelector) -> Result<GroupedTableHandle> {
        self.add(Some(table.0), NodeKind::GroupTable(selector)).map(GroupedTableHandle)
    }

    fn aggregate(
        &mut self,
        grouped: GroupedStreamHandle,
        initializer: Initializer,
        aggregator: Aggregator,
        store_name: &str,
    ) -> Result<TableHandle> {
        self.check(grouped.0)?;
        let store = self.kv_store(store_name);
        self.add(
            Some(grouped.0),
            NodeKind::Aggregate {
                initializer,
                aggregator,
                store,
            },
        )
        .map(TableHandle)
    }

    fn windowed_aggregate(
        &mut self,
        grouped: GroupedStreamHandle,
        window: WindowExpression,
        initializer: Initializer,
        aggregator: Aggregator,
        merger: Option<Merger>,
        store_name: &str,
    ) -> Result<TableHandle> {
        self.check(grouped.0)?;
        let store = Arc::new(RwLock::new(WindowStore::new(window.window_type())));
        self.stores.insert(store_name.to_string(), StoreView::Windowed(store.clone()));
        self.add(
            Some(grouped.0),
            NodeKind::WindowedAggregate {
                window,
                initializer,
                aggregator,
                merger,
                store,
            },
        )
        .map(TableHandle)
    }

    fn table_aggregate(
        &mut self,
        grouped: GroupedTableHandle,
        initializer: Initializer,
        adder: Aggregator,
        subtractor: Aggregator,
        store_name: &str,
    ) -> Result<TableHandle> {
        self.check(grouped.0)?;
        let store = self.kv_store(store_name);
        self.add(
            Some(grouped.0),
            NodeKind::TableAggregate {
                initializer,
                adder,
                subtractor,
                store,
            },
        )
        .map(TableHandle)
    }

    fn stream_table_join(
        &mut self,
        stream: StreamHandle,
        table: TableHandle,
        joiner: ValueJoiner,
        join_type: JoinType,
    ) -> Result<StreamHandle> {
        self.check(stream.0)?;
        let materialized = Arc::new(RwLock::new(KeyValueStore::new()));
        self.add(Some(table.0), NodeKind::Materialize(materialized.clone()))?;
        self.add(
            Some(stream.0),
            NodeKind::Join {
                table: materialized,
                joiner,
                join_type,
            },
        )
        .map(StreamHandle)
    }

    fn to_change_stream(&mut self, table: TableHandle) -> Result<StreamHandle> {
        self.add(Some(table.0), NodeKind::ToStream).map(StreamHandle)
    }

    fn sink_to(&mut self, stream: StreamHandle, sink: SinkSpec) -> Result<()> {
        self.add(Some(stream.0), NodeKind::Sink(sink)).map(|_| ())
    }

    fn to_queue(&mut self, stream: StreamHandle, queue: Sender<QueueRow>, limit: Option<usize>) -> Result<()> {
        self.add(
            Some(stream.0),
            NodeKind::Queue {
                sender: queue,
                limit,
                delivered: 0,
            },
        )
        .map(|_| ())
    }

    fn build(&mut self) -> Result<Topology> {
        let mut description = String::new();
        for &source in &self.sources {
            self.describe(source, 0, &mut description);
        }
        let topology = LocalTopology {
            nodes: std::mem::take(&mut self.nodes),
            sources: std::mem::take(&mut self.sources),
            stores: std::mem::take(&mut self.stores),
        };
        Ok(Topology {
            description,
            inner: Box::new(topology),
        })
    }
}

struct Worker {
    shutdown: Sender<()>,
    subscription: SubscriptionId,
    thread: JoinHandle<()>,
}

/// A topology bound to a broker, processed by one worker thread
pub struct LocalInstance {
    broker: Arc<InMemoryBroker>,
    properties: RuntimeProperties,
    application_id: String,
    topology: Mutex<Option<LocalTopology>>,
    stores: HashMap<String, StoreView>,
    state: Arc<Mutex<InstanceState>>,
    handler: Arc<Mutex<Option<UncaughtExceptionHandler>>>,
    worker: Mutex<Option<Worker>>,
}

impl fmt::Debug for LocalInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalInstance")
            .field("application_id", &self.application_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl LocalInstance {
    fn new(broker: Arc<InMemoryBroker>, topology: LocalTopology, properties: RuntimeProperties) -> Self {
        let application_id = properties
            .values
            .get(APPLICATION_ID_CONFIG)
            .and_then(|v| v.as_str())
            .unwrap_or("bayun-local")
            .to_string();
        LocalInstance {
            broker,
            stores: topology.stores.clone(),
            topology: Mutex::new(Some(topology)),
            properties,
            application_id,
            state: Arc::new(Mutex::new(InstanceState::Created)),
            handler: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }
}

fn run_worker(
    mut topology: LocalTopology,
    broker: Arc<InMemoryBroker>,
    properties: RuntimeProperties,
    records: Receiver<BrokerRecord>,
    shutdown: Receiver<()>,
    state: Arc<Mutex<InstanceState>>,
    handler: Arc<Mutex<Option<UncaughtExceptionHandler>>>,
) {
    let env = Env {
        broker: &broker,
        logger: &properties.processing_logger,
        collectors: &properties.collectors,
    };
    let mut process = |record: &BrokerRecord| -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| topology.on_record(&env, record)));
        match outcome {
            Ok(()) => true,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Worker failed on {}@{}: {}", record.topic, record.offset, message);
                *state.lock() = InstanceState::Error;
                let handler = handler.lock().clone();
                if let Some(handler) = handler {
                    handler(&message);
                }
                false
            }
        }
    };

    loop {
        crossbeam::select! {
            recv(records) -> msg => match msg {
                Ok(record) => {
                    if !process(&record) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(shutdown) -> _ => {
                for record in records.try_iter() {
                    if !process(&record) {
                        return;
                    }
                }
                return;
            }
        }
    }
}

impl RunningInstance for LocalInstance {
    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            InstanceState::Created => {}
            InstanceState::Running => return Ok(()),
            other => return Err(RuntimeError::InvalidState(other, "start")),
        }
        let topology = self
            .topology
            .lock()
            .take()
            .ok_or(RuntimeError::InvalidState(*state, "start"))?;

        let topics = topology.source_topics();
        let (record_tx, record_rx) = channel::unbounded();
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let subscription = self.broker.subscribe(&topics, record_tx);

        let broker = self.broker.clone();
        let properties = self.properties.clone();
        let worker_state = self.state.clone();
        let handler = self.handler.clone();
        let thread = thread::Builder::new()
            .name(self.application_id.clone())
            .spawn(move || run_worker(topology, broker, properties, record_rx, shutdown_rx, worker_state, handler))
            .map_err(|e| RuntimeError::WorkerFailed(e.to_string()))?;

        *state = InstanceState::Running;
        *self.worker.lock() = Some(Worker {
            shutdown: shutdown_tx,
            subscription,
            thread,
        });
        info!("Started {} reading {:?}", self.application_id, topics);
        Ok(())
    }

    fn close(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.broker.unsubscribe(worker.subscription);
            // the worker may already have exited after a failure
            let _ = worker.shutdown.send(());
            if worker.thread.join().is_err() {
                warn!("Worker of {} panicked while stopping", self.application_id);
            }
            debug!("Stopped {}", self.application_id);
        }
        let mut state = self.state.lock();
        if *state != InstanceState::Error {
            *state = InstanceState::NotRunning;
        }
        self.topology.lock().take();
    }

    fn set_uncaught_exception_handler(&self, handler: UncaughtExceptionHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    fn store(&self, name: &str) -> Result<StoreView> {
        let state = self.state();
        if state != InstanceState::Running {
            return Err(RuntimeError::StoreNotAvailable {
                store: name.to_string(),
                state,
            });
        }
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownStore(name.to_string()))
    }
}

/// Runtime over an in-memory broker
#[derive(Clone, Default)]
pub struct LocalRuntime {
    broker: Arc<InMemoryBroker>,
}

impl LocalRuntime {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        LocalRuntime { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

impl StreamRuntime for LocalRuntime {
    fn new_topology(&self) -> Box<dyn TopologyBuilder> {
        Box::new(LocalTopologyBuilder::new())
    }

    fn create_instance(&self, topology: Topology, properties: RuntimeProperties) -> Result<Arc<dyn RunningInstance>> {
        let local = topology
            .inner
            .downcast::<LocalTopology>()
            .map_err(|_| RuntimeError::ForeignTopology)?;
        Ok(Arc::new(LocalInstance::new(self.broker.clone(), *local, properties)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::catalog::{DataValue, LogicalSchema, SqlType};
    use crate::common::processing_log::ProcessingLogger;
    use crate::query::codec::{KeyCodec, ValueCodec};
    use crate::query::plan::{Format, SerdeOptions};
    use crate::query::timestamp::TimestampExtractor;

    fn schema() -> LogicalSchema {
        LogicalSchema::builder()
            .key_column("K", SqlType::String)
            .value_column("V", SqlType::BigInt)
            .build()
            .unwrap()
    }

    fn source(topic: &str) -> SourceSpec {
        SourceSpec {
            topic: topic.to_string(),
            key_codec: KeyCodec::new(Format::Json, &schema(), None),
            value_codec: ValueCodec::new(Format::Json, &schema(), SerdeOptions::default()),
            timestamp_extractor: TimestampExtractor::Metadata,
        }
    }

    fn properties() -> RuntimeProperties {
        RuntimeProperties {
            values: Default::default(),
            processing_logger: Arc::new(ProcessingLogger::new("test", 16)),
            collectors: Vec::new(),
        }
    }

    fn produce(broker: &InMemoryBroker, topic: &str, key: &str, value: i64, ts: Timestamp) {
        broker.produce(
            topic,
            Some(format!("\"{}\"", key).into_bytes()),
            Some(format!("{{\"V\":{}}}", value).into_bytes()),
            ts,
        );
    }

    #[test]
    fn test_filter_and_sink() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = LocalRuntime::new(broker.clone());
        let mut builder = runtime.new_topology();

        let stream = builder.stream(source("in")).unwrap();
        let positive: RowPredicate =
            Arc::new(|_: &RecordContext<'_>, row: &GenericRow| row.get(0).and_then(|v| v.as_i64()).unwrap_or(0) > 0);
        let filtered = builder.filter(stream, positive).unwrap();
        builder
            .sink_to(
                filtered,
                SinkSpec {
                    topic: "out".into(),
                    key_codec: KeyCodec::new(Format::Json, &schema(), None),
                    value_codec: ValueCodec::new(Format::Json, &schema(), SerdeOptions::default()),
                },
            )
            .unwrap();
        let instance = runtime.create_instance(builder.build().unwrap(), properties()).unwrap();

        produce(&broker, "in", "a", -1, 1);
        produce(&broker, "in", "b", 5, 2);
        instance.start().unwrap();
        assert_eq!(instance.state(), InstanceState::Running);

        let out = broker.await_records("out", 1, Duration::from_secs(5));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value.as_deref(), Some(&b"{\"V\":5}"[..]));
        assert_eq!(out[0].timestamp, 2);

        instance.close();
        instance.close();
        assert_eq!(instance.state(), InstanceState::NotRunning);
    }

    #[test]
    fn test_store_only_while_running() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = LocalRuntime::new(broker);
        let mut builder = runtime.new_topology();
        let stream = builder.stream(source("in")).unwrap();
        let grouped = builder.group_stream(stream, None).unwrap();
        let init: Initializer = Arc::new(|| GenericRow::new(vec![DataValue::Integer(0)]));
        let count: Aggregator = Arc::new(|_: &RowKey, _: &GenericRow, agg: GenericRow| {
            GenericRow::new(vec![DataValue::Integer(agg.get(0).and_then(|v| v.as_i64()).unwrap_or(0) + 1)])
        });
        builder.aggregate(grouped, init, count, "Aggregate-Materialize").unwrap();
        let instance = runtime.create_instance(builder.build().unwrap(), properties()).unwrap();

        assert!(matches!(
            instance.store("Aggregate-Materialize"),
            Err(RuntimeError::StoreNotAvailable { .. })
        ));
        instance.start().unwrap();
        assert!(matches!(instance.store("Aggregate-Materialize"), Ok(StoreView::KeyValue(_))));
        assert!(matches!(instance.store("missing"), Err(RuntimeError::UnknownStore(_))));
        instance.close();
        assert!(instance.start().is_err());
    }

    #[test]
    fn test_bad_record_goes_to_processing_log() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = LocalRuntime::new(broker.clone());
        let mut builder = runtime.new_topology();
        let stream = builder.stream(source("in")).unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        builder.to_queue(stream, tx, Some(1)).unwrap();
        let props = properties();
        let logger = props.processing_logger.clone();
        let instance = runtime.create_instance(builder.build().unwrap(), props).unwrap();

        broker.produce("in", Some(b"\"a\"".to_vec()), Some(b"not json".to_vec()), 0);
        produce(&broker, "in", "b", 1, 1);
        produce(&broker, "in", "c", 2, 2);
        instance.start().unwrap();

        let row = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(row.key, RowKey::new(vec![DataValue::Text("b".into())]));
        instance.close();
        // limit reached after one row
        assert!(rx.try_recv().is_err());
        assert_eq!(logger.len(), 1);
        assert_eq!(instance.state(), InstanceState::NotRunning);
    }

    #[test]
    fn test_foreign_topology_rejected() {
        let runtime = LocalRuntime::new(Arc::new(InMemoryBroker::new()));
        let topology = Topology {
            description: String::new(),
            inner: Box::new(42u8),
        };
        assert!(matches!(
            runtime.create_instance(topology, properties()),
            Err(RuntimeError::ForeignTopology)
        ));
    }
}
