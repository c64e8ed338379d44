//! Query Engine
//!
//! Executes statements against the metastore and the stream runtime.
//! DDL statements change the metastore only. CREATE ... AS SELECT and
//! INSERT INTO compile a persistent query and register it; a bare SELECT
//! compiles a transient query handed back to the caller.
//!
//! Queries are returned unstarted. Whoever executed the statement decides
//! when, and whether, to start them.

pub mod capacity;
pub mod metrics;
pub mod planner;
pub mod query_executor;
pub mod query_id;
pub mod query_metadata;
pub mod statement;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

pub use self::metrics::MetricCollectors;
pub use self::query_id::QueryIdGenerator;
pub use self::query_metadata::{PersistentQueryMetadata, QueryCloseCallback, QueryMetadata, TransientQueryMetadata};
pub use self::statement::Statement;

use crate::catalog::{DataSource, LogicalSchema, MetaStore, MetaStoreError};
use crate::common::config::{ConfigError, EngineConfig};
use crate::common::processing_log::ProcessingLogContext;
use crate::common::types::{DataSourceType, QueryId};
use crate::query::builder::PlanError;
use crate::query::timestamp::TimestampPolicy;
use crate::runtime::{RecordCollector, RuntimeError, StreamRuntime};

use self::planner::QueryPlanner;
use self::query_executor::QueryExecutor;
use self::statement::{CreateAsSelect, CreateSource, InsertInto, QuerySpec};

#[derive(Error, Debug)]
pub enum EngineError {
    /// The statement is invalid for the current state of the engine
    #[error("{0}")]
    UserStatement(String),
    #[error("{0}")]
    CapacityExceeded(String),
    #[error("{0}")]
    Plan(#[from] PlanError),
    #[error("{0}")]
    MetaStore(#[from] MetaStoreError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

fn user(message: impl Into<String>) -> EngineError {
    EngineError::UserStatement(message.into())
}

/// Outcome of executing one statement
#[derive(Debug)]
pub enum ExecuteResult {
    Message(String),
    Persistent(Arc<PersistentQueryMetadata>),
    Transient(TransientQueryMetadata),
}

impl ExecuteResult {
    pub fn message(&self) -> Option<&str> {
        match self {
            ExecuteResult::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentQueryMetadata>> {
        match self {
            ExecuteResult::Persistent(query) => Some(query),
            _ => None,
        }
    }
}

/// Metastore plus the persistent queries currently registered against it
#[derive(Default)]
struct QueryRegistry {
    metastore: MetaStore,
    persistent: Mutex<BTreeMap<QueryId, Arc<PersistentQueryMetadata>>>,
}

impl QueryRegistry {
    fn register(&self, query: Arc<PersistentQueryMetadata>) {
        let query_id = query.query_id().clone();
        self.metastore
            .add_query_references(&query_id, query.metadata().sources(), Some(query.sink_name()));
        self.persistent.lock().insert(query_id, query);
    }

    fn unregister(&self, query_id: &QueryId) {
        if self.persistent.lock().remove(query_id).is_some() {
            self.metastore.remove_query_references(query_id);
            debug!("Unregistered query {}", query_id);
        }
    }
}

pub struct QueryEngine {
    runtime: Arc<dyn StreamRuntime>,
    processing_log: Arc<ProcessingLogContext>,
    metrics: Arc<MetricCollectors>,
    id_generator: QueryIdGenerator,
    registry: Arc<QueryRegistry>,
}

impl QueryEngine {
    pub fn new(runtime: Arc<dyn StreamRuntime>, processing_log: Arc<ProcessingLogContext>) -> Self {
        QueryEngine {
            runtime,
            processing_log,
            metrics: Arc::new(MetricCollectors::new()),
            id_generator: QueryIdGenerator::new(),
            registry: Arc::new(QueryRegistry::default()),
        }
    }

    pub fn metastore(&self) -> &MetaStore {
        &self.registry.metastore
    }

    pub fn processing_log(&self) -> &Arc<ProcessingLogContext> {
        &self.processing_log
    }

    pub fn metrics(&self) -> &Arc<MetricCollectors> {
        &self.metrics
    }

    pub fn query_id_generator(&self) -> &QueryIdGenerator {
        &self.id_generator
    }

    pub fn persistent_query(&self, query_id: &QueryId) -> Option<Arc<PersistentQueryMetadata>> {
        self.registry.persistent.lock().get(query_id).cloned()
    }

    pub fn persistent_queries(&self) -> Vec<Arc<PersistentQueryMetadata>> {
        self.registry.persistent.lock().values().cloned().collect()
    }

    pub fn num_persistent_queries(&self) -> usize {
        self.registry.persistent.lock().len()
    }

    /// Close a registered persistent query, removing it from the engine
    pub fn terminate_query(&self, query_id: &QueryId) -> Result<()> {
        let query = self
            .persistent_query(query_id)
            .ok_or_else(|| user(format!("No running query with id {} was found", query_id)))?;
        query.close();
        Ok(())
    }

    /// Close every persistent query
    pub fn close(&self) {
        let queries = self.persistent_queries();
        info!("Closing {} persistent queries", queries.len());
        for query in queries {
            query.close();
        }
    }

    fn unregister_on_close(&self) -> QueryCloseCallback {
        let registry: Weak<QueryRegistry> = Arc::downgrade(&self.registry);
        Arc::new(move |query_id: &QueryId| {
            if let Some(registry) = registry.upgrade() {
                registry.unregister(query_id);
            }
        })
    }

    fn executor<'a>(
        &'a self,
        config: &'a EngineConfig,
        overrides: &'a BTreeMap<String, Value>,
        on_close: QueryCloseCallback,
    ) -> QueryExecutor<'a> {
        let collectors = vec![self.metrics.clone() as Arc<dyn RecordCollector>];
        QueryExecutor::new(config, overrides, self.runtime.as_ref(), &self.processing_log, collectors, on_close)
    }

    /// Execute one statement. `overrides` are applied on top of `config` for this statement only.
    pub fn execute(
        &self,
        statement: &Statement,
        statement_text: &str,
        config: &EngineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ExecuteResult> {
        let config = config.with_overrides(overrides)?;
        match statement {
            Statement::CreateSource(create) => self.create_source(create),
            Statement::DropSource { source_type, name } => self.drop_source(*source_type, name),
            Statement::CreateAsSelect(create) => self.create_as_select(create, statement_text, &config, overrides),
            Statement::InsertInto(insert) => self.insert_into(insert, statement_text, &config, overrides),
            Statement::Query(query) => self.transient_query(query, statement_text, &config, overrides),
            Statement::TerminateQuery { query_id } => {
                self.terminate_query(query_id)?;
                Ok(ExecuteResult::Message("Query terminated.".to_string()))
            }
            Statement::RunScript => Err(user("RUN SCRIPT can only be executed by the command processor")),
        }
    }

    fn create_source(&self, create: &CreateSource) -> Result<ExecuteResult> {
        let mut builder = LogicalSchema::builder();
        for column in &create.key {
            builder = builder.key_column(column.name.clone(), column.sql_type);
        }
        let schema = builder
            .value_columns(create.value.iter().map(|c| (c.name.clone(), c.sql_type)))
            .build()
            .map_err(|e| user(e.to_string()))?;
        TimestampPolicy::for_source(create.timestamp_column.as_ref(), &schema).map_err(|e| user(e.to_string()))?;

        if let Some(existing) = self.metastore().get_source(&create.name) {
            if create.if_not_exists {
                return Ok(ExecuteResult::Message(format!(
                    "Cannot add {} '{}': A {} with the same name already exists",
                    create.source_type, create.name, existing.source_type
                )));
            }
            return Err(MetaStoreError::SourceAlreadyExists {
                name: create.name.clone(),
                source_type: existing.source_type,
            }
            .into());
        }

        self.metastore().put_source(
            DataSource {
                name: create.name.clone(),
                source_type: create.source_type,
                schema,
                topic: create.topic.clone(),
                formats: create.formats,
                timestamp_column: create.timestamp_column.clone(),
                window_info: create.window,
                is_query_sink: false,
            },
            false,
        )?;
        let message = match create.source_type {
            DataSourceType::Stream => "Stream created",
            DataSourceType::Table => "Table created",
        };
        Ok(ExecuteResult::Message(message.to_string()))
    }

    fn drop_source(&self, source_type: DataSourceType, name: &str) -> Result<ExecuteResult> {
        let source = match self.metastore().get_source(name) {
            Some(source) => source,
            None => return Ok(ExecuteResult::Message(format!("Source {} does not exist.", name))),
        };
        if source.source_type != source_type {
            return Err(user(format!(
                "Incompatible data source type is {}, but statement was DROP {}",
                source.source_type, source_type
            )));
        }
        self.metastore().delete_source(name)?;
        Ok(ExecuteResult::Message(format!(
            "Source {} (topic: {}) was dropped.",
            name, source.topic
        )))
    }

    fn create_as_select(
        &self,
        create: &CreateAsSelect,
        statement_text: &str,
        config: &EngineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ExecuteResult> {
        if let Some(existing) = self.metastore().get_source(&create.name) {
            return Err(MetaStoreError::SourceAlreadyExists {
                name: create.name.clone(),
                source_type: existing.source_type,
            }
            .into());
        }

        let planned = QueryPlanner::new(self.metastore()).plan(&create.query)?;
        if planned.result_type != create.sink_type {
            return Err(user(format!(
                "Invalid result type. Your SELECT query produces a {0}. \
                 Please use CREATE {0} AS SELECT statement instead.",
                planned.result_type
            )));
        }

        let formats = create.formats.unwrap_or(planned.source_formats);
        let sink = DataSource {
            name: create.name.clone(),
            source_type: create.sink_type,
            schema: planned.sink_schema(),
            topic: create.topic.clone().unwrap_or_else(|| create.name.clone()),
            formats,
            timestamp_column: None,
            window_info: planned.window,
            is_query_sink: true,
        };
        let query_id = match create.sink_type {
            DataSourceType::Stream => self.id_generator.next_csas_id(&create.name),
            DataSourceType::Table => self.id_generator.next_ctas_id(&create.name),
        };

        let sources = planned.sources.clone();
        let plan = planned.into_sink_plan(&sink.topic, formats);
        let query = self
            .executor(config, overrides, self.unregister_on_close())
            .build_persistent_query(statement_text, query_id, &sink, sources, &plan)?;

        if let Err(e) = self.metastore().put_source(sink, false) {
            query.close();
            return Err(e.into());
        }
        let query = Arc::new(query);
        self.registry.register(query.clone());
        info!("Registered persistent query {} writing to {}", query.query_id(), create.name);
        Ok(ExecuteResult::Persistent(query))
    }

    fn insert_into(
        &self,
        insert: &InsertInto,
        statement_text: &str,
        config: &EngineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ExecuteResult> {
        let sink = self
            .metastore()
            .get_source(&insert.sink)
            .ok_or_else(|| user(format!("{} does not exist.", insert.sink)))?;
        if sink.source_type != DataSourceType::Stream {
            return Err(user(format!(
                "INSERT INTO can only be used to insert into a stream. {} is a table.",
                sink.name
            )));
        }

        let planned = QueryPlanner::new(self.metastore()).plan(&insert.query)?;
        if planned.result_type != DataSourceType::Stream {
            return Err(user(format!(
                "Incompatible data sink and query result. Data sink ({}) type is STREAM but select query result is {}.",
                sink.name, planned.result_type
            )));
        }
        if planned.sources.contains(&sink.name) {
            return Err(user(format!(
                "Cannot insert into {} from a query that reads from it.",
                sink.name
            )));
        }
        let result_schema = planned.sink_schema();
        if result_schema != sink.schema {
            return Err(user(format!(
                "Incompatible schema between results and sink. Result schema is {}, but the sink schema is {}.",
                result_schema, sink.schema
            )));
        }
        if planned.window != sink.window_info {
            return Err(user(format!(
                "Incompatible windowing between results and sink {}.",
                sink.name
            )));
        }

        let query_id = self.id_generator.next_insert_id();
        let sources = planned.sources.clone();
        let plan = planned.into_sink_plan(&sink.topic, sink.formats);
        let query = Arc::new(
            self.executor(config, overrides, self.unregister_on_close())
                .build_persistent_query(statement_text, query_id, &sink, sources, &plan)?,
        );
        self.registry.register(query.clone());
        info!("Registered insert query {} writing to {}", query.query_id(), sink.name);
        Ok(ExecuteResult::Persistent(query))
    }

    fn transient_query(
        &self,
        query: &QuerySpec,
        statement_text: &str,
        config: &EngineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ExecuteResult> {
        let planned = QueryPlanner::new(self.metastore()).plan(query)?;
        let query_id = self.id_generator.next_transient_id(&query.from);
        let no_op: QueryCloseCallback = Arc::new(|_: &QueryId| {});
        let transient = self.executor(config, overrides, no_op).build_transient_query(
            statement_text,
            query_id,
            planned.sources.clone(),
            &planned.plan,
            &planned.schema,
            planned.limit,
        )?;
        if planned.result_type == DataSourceType::Table {
            warn!("Transient query {} emits the changelog of a table", transient.query_id());
        }
        Ok(ExecuteResult::Transient(transient))
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        self.close();
    }
}
