#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use bayunstream::catalog::{DataValue, SqlType};
use bayunstream::common::config::EngineConfig;
use bayunstream::common::processing_log::ProcessingLogContext;
use bayunstream::common::types::{DataSourceType, Timestamp};
use bayunstream::computation::{Command, CommandId, QueuedCommand, StatementExecutor, StatusStore};
use bayunstream::engine::statement::{ColumnDef, CreateAsSelect, CreateSource, QuerySpec};
use bayunstream::engine::{ExecuteResult, QueryEngine, Statement};
use bayunstream::query::plan::Formats;
use bayunstream::runtime::{BrokerRecord, InMemoryBroker, LocalRuntime};

pub const TIMEOUT: Duration = Duration::from_secs(5);

// Configuration accepted by the statement executor
pub fn test_config() -> EngineConfig {
    EngineConfig {
        application_server: Some("http://localhost:8088".to_string()),
        ..EngineConfig::default()
    }
}

/// One engine node over its own in-memory broker
pub struct TestNode {
    pub broker: Arc<InMemoryBroker>,
    pub engine: Arc<QueryEngine>,
    pub statuses: Arc<StatusStore>,
    pub executor: Arc<StatementExecutor>,
}

pub fn node() -> Result<TestNode> {
    node_with_config(test_config())
}

pub fn node_with_config(config: EngineConfig) -> Result<TestNode> {
    let broker = Arc::new(InMemoryBroker::new());
    node_on_broker(broker, config)
}

pub fn node_on_broker(broker: Arc<InMemoryBroker>, config: EngineConfig) -> Result<TestNode> {
    let runtime = LocalRuntime::new(broker.clone());
    let engine = Arc::new(QueryEngine::new(Arc::new(runtime), Arc::new(ProcessingLogContext::new())));
    let statuses = Arc::new(StatusStore::new());
    let executor = Arc::new(StatementExecutor::new(engine.clone(), statuses.clone()));
    executor.configure(config)?;
    Ok(TestNode {
        broker,
        engine,
        statuses,
        executor,
    })
}

impl TestNode {
    /// Execute directly against the engine, bypassing the command log
    pub fn execute(&self, statement: &Statement) -> Result<ExecuteResult> {
        Ok(self
            .engine
            .execute(statement, &statement.to_text(), &test_config(), &BTreeMap::new())?)
    }

    pub fn produce(&self, topic: &str, key: &str, value: &str, timestamp: Timestamp) {
        self.broker.produce(
            topic,
            Some(key.as_bytes().to_vec()),
            Some(value.as_bytes().to_vec()),
            timestamp,
        );
    }

    pub fn produce_tombstone(&self, topic: &str, key: &str, timestamp: Timestamp) {
        self.broker.produce(topic, Some(key.as_bytes().to_vec()), None, timestamp);
    }

    pub fn await_records(&self, topic: &str, count: usize) -> Vec<BrokerRecord> {
        self.broker.await_records(topic, count, TIMEOUT)
    }
}

pub fn columns(defs: &[(&str, SqlType)]) -> Vec<ColumnDef> {
    defs.iter().map(|(name, t)| ColumnDef::new(*name, *t)).collect()
}

pub fn create_source(
    source_type: DataSourceType,
    name: &str,
    topic: &str,
    key: &[(&str, SqlType)],
    value: &[(&str, SqlType)],
) -> Statement {
    Statement::CreateSource(CreateSource {
        source_type,
        name: name.to_string(),
        key: columns(key),
        value: columns(value),
        topic: topic.to_string(),
        formats: Formats::default(),
        timestamp_column: None,
        window: None,
        if_not_exists: false,
    })
}

// ORDERS stream: ID BIGINT KEY, ITEM STRING, PRICE DOUBLE over topic "orders"
pub fn create_orders() -> Statement {
    create_source(
        DataSourceType::Stream,
        "ORDERS",
        "orders",
        &[("ID", SqlType::BigInt)],
        &[("ITEM", SqlType::String), ("PRICE", SqlType::Double)],
    )
}

pub fn create_as_select(sink_type: DataSourceType, name: &str, query: QuerySpec) -> Statement {
    Statement::CreateAsSelect(CreateAsSelect {
        sink_type,
        name: name.to_string(),
        topic: None,
        formats: None,
        query,
    })
}

pub fn order(item: &str, price: f64) -> String {
    format!(r#"{{"ITEM":"{}","PRICE":{}}}"#, item, price)
}

/// A command for `statement` as it would be read back from the log
pub fn queued(statement: &Statement, offset: u64) -> Result<QueuedCommand> {
    Ok(QueuedCommand::new(
        CommandId::for_statement(statement)?,
        Command::new(statement.to_text(), BTreeMap::new(), BTreeMap::new()),
        offset,
    ))
}

pub fn text(bytes: &Option<Vec<u8>>) -> Option<String> {
    bytes.as_ref().map(|b| String::from_utf8_lossy(b).into_owned())
}

pub fn json(bytes: &Option<Vec<u8>>) -> Result<serde_json::Value> {
    let bytes = bytes.as_ref().ok_or_else(|| anyhow::anyhow!("tombstone"))?;
    Ok(serde_json::from_slice(bytes)?)
}

// Poll until `f` yields a value or the timeout passes
pub fn eventually<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn text_value(s: &str) -> DataValue {
    DataValue::Text(s.to_string())
}
