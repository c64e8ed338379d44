// Query Executor
//
// Compiles a plan into a runnable query: lowers it onto a fresh topology,
// gives it an application id, assembles its runtime properties and wires
// the uncaught-exception handler and, for tables, the materialization read
// path.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::channel;
use log::{debug, error};
use serde_json::Value;

use crate::catalog::{DataSource, LogicalSchema};
use crate::common::config::{EngineConfig, APPLICATION_ID_CONFIG, INTERNAL_TOPIC_PREFIX};
use crate::common::processing_log::ProcessingLogContext;
use crate::common::types::QueryId;
use crate::query::builder::{Holder, PlanBuilder, PlanError};
use crate::query::materialization::MaterializationProvider;
use crate::query::plan::ExecutionStep;
use crate::runtime::{RecordCollector, RuntimeProperties, StreamRuntime, UncaughtExceptionHandler};

use super::query_metadata::{
    PersistentQueryMetadata, QueryCloseCallback, QueryMetadata, QueryMetadataParts, TransientQueryMetadata,
};
use super::{EngineError, Result};

/// Name of the processing logger that receives production errors
pub const PRODUCTION_ERROR_LOGGER_CONFIG: &str = "bayun.production.error.logger";
pub const CONSUMER_COLLECTORS_CONFIG: &str = "consumer.collectors";
pub const PRODUCER_COLLECTORS_CONFIG: &str = "producer.collectors";
const CONSUMER_COLLECTOR: &str = "ConsumerCollector";
const PRODUCER_COLLECTOR: &str = "ProducerCollector";

pub fn query_application_id(service_id: &str, query_prefix: &str, query_id: &QueryId) -> String {
    format!("{}{}{}", service_id, query_prefix, query_id)
}

fn add_time_suffix(original: &str) -> String {
    format!("{}_{}", original, chrono::Utc::now().timestamp_millis())
}

/// Append `value` to a list property held either as a comma separated string or a list
fn update_list_property(properties: &mut BTreeMap<String, Value>, key: &str, value: &str) -> Result<()> {
    let mut list: Vec<Value> = match properties.get(key) {
        None => Vec::new(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(EngineError::UserStatement(format!(
                "Expecting list or string for property: {}, got {}",
                key, other
            )))
        }
    };
    list.push(Value::String(value.to_string()));
    properties.insert(key.to_string(), Value::Array(list));
    Ok(())
}

fn uncaught_exception_handler(query_id: QueryId) -> UncaughtExceptionHandler {
    Arc::new(move |message: &str| {
        error!("Unhandled exception caught in query {}: {}", query_id, message);
    })
}

pub struct QueryExecutor<'a> {
    config: &'a EngineConfig,
    overrides: &'a BTreeMap<String, Value>,
    runtime: &'a dyn StreamRuntime,
    processing_log: &'a ProcessingLogContext,
    collectors: Vec<Arc<dyn RecordCollector>>,
    on_close: QueryCloseCallback,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        config: &'a EngineConfig,
        overrides: &'a BTreeMap<String, Value>,
        runtime: &'a dyn StreamRuntime,
        processing_log: &'a ProcessingLogContext,
        collectors: Vec<Arc<dyn RecordCollector>>,
        on_close: QueryCloseCallback,
    ) -> Self {
        QueryExecutor {
            config,
            overrides,
            runtime,
            processing_log,
            collectors,
            on_close,
        }
    }

    fn service_id(&self) -> String {
        format!("{}{}", INTERNAL_TOPIC_PREFIX, self.config.service_id)
    }

    fn build_stream_properties(&self, application_id: &str, query_id: &QueryId) -> Result<RuntimeProperties> {
        let mut values = self.config.stream_properties();
        values.insert(APPLICATION_ID_CONFIG.to_string(), Value::String(application_id.to_string()));
        let logger = self.processing_log.get_logger(query_id.as_str());
        values.insert(
            PRODUCTION_ERROR_LOGGER_CONFIG.to_string(),
            Value::String(logger.name().to_string()),
        );
        update_list_property(&mut values, CONSUMER_COLLECTORS_CONFIG, CONSUMER_COLLECTOR)?;
        update_list_property(&mut values, PRODUCER_COLLECTORS_CONFIG, PRODUCER_COLLECTOR)?;
        Ok(RuntimeProperties {
            values,
            processing_logger: logger,
            collectors: self.collectors.clone(),
        })
    }

    pub fn build_persistent_query(
        &self,
        statement_text: &str,
        query_id: QueryId,
        sink: &DataSource,
        sources: Vec<String>,
        plan: &ExecutionStep,
    ) -> Result<PersistentQueryMetadata> {
        let mut topology = self.runtime.new_topology();
        let holder = {
            let mut builder = PlanBuilder::new(&mut *topology, query_id.clone(), self.processing_log);
            plan.build(&mut builder)?
        };

        let application_id =
            query_application_id(&self.service_id(), &self.config.persistent_query_name_prefix, &query_id);
        let properties = self.build_stream_properties(&application_id, &query_id)?;
        let values = properties.values.clone();
        let built = topology.build()?;
        let topology_description = built.description.clone();
        let instance = self.runtime.create_instance(built, properties)?;
        instance.set_uncaught_exception_handler(uncaught_exception_handler(query_id.clone()));

        let materialization = match holder {
            Holder::Table(table) => table
                .materialization
                .map(|builder| MaterializationProvider::new(builder.build(), instance.clone())),
            _ => None,
        };
        debug!(
            "Built persistent query {} into {} (materialized: {})",
            query_id,
            sink.name,
            materialization.is_some()
        );

        let metadata = QueryMetadata::new(QueryMetadataParts {
            query_id,
            statement_text: statement_text.to_string(),
            schema: sink.schema.clone(),
            sources,
            application_id,
            plan_summary: plan.summary(),
            topology_description,
            properties: values,
            overrides: self.overrides.clone(),
            instance,
            on_close: self.on_close.clone(),
        });
        Ok(PersistentQueryMetadata::new(
            metadata,
            sink.name.clone(),
            sink.source_type,
            materialization,
        ))
    }

    pub fn build_transient_query(
        &self,
        statement_text: &str,
        query_id: QueryId,
        sources: Vec<String>,
        plan: &ExecutionStep,
        schema: &LogicalSchema,
        limit: Option<usize>,
    ) -> Result<TransientQueryMetadata> {
        let mut topology = self.runtime.new_topology();
        let (sender, receiver) = channel::unbounded();
        {
            let mut builder = PlanBuilder::new(&mut *topology, query_id.clone(), self.processing_log);
            let handle = match plan.build(&mut builder)? {
                Holder::Stream(stream) => stream.handle,
                Holder::Table(table) => builder.topology().to_change_stream(table.handle)?,
                other => {
                    return Err(PlanError::InvalidPlanShape {
                        step: "TransientQuery".to_string(),
                        expected: "stream or table",
                        actual: other.kind(),
                    }
                    .into())
                }
            };
            builder.topology().to_queue(handle, sender, limit)?;
        }

        let application_id = add_time_suffix(&query_application_id(
            &self.service_id(),
            &self.config.transient_query_name_prefix,
            &query_id,
        ));
        let properties = self.build_stream_properties(&application_id, &query_id)?;
        let values = properties.values.clone();
        let built = topology.build()?;
        let topology_description = built.description.clone();
        let instance = self.runtime.create_instance(built, properties)?;
        instance.set_uncaught_exception_handler(uncaught_exception_handler(query_id.clone()));

        let metadata = QueryMetadata::new(QueryMetadataParts {
            query_id,
            statement_text: statement_text.to_string(),
            schema: schema.value_only(),
            sources,
            application_id,
            plan_summary: plan.summary(),
            topology_description,
            properties: values,
            overrides: self.overrides.clone(),
            instance,
            on_close: self.on_close.clone(),
        });
        Ok(TransientQueryMetadata::new(metadata, receiver, limit))
    }
}
