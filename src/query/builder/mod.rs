//! Physical Plan Builder
//!
//! Lowers an execution plan into runtime topology stages. `ExecutionStep::build`
//! walks the tree children first and hands each step, together with the
//! holders of its children, to the matching `visit_*` handler here. A handler
//! registers the runtime stages for its step and returns the step's holder.
//!
//! A builder compiles one plan once; running the same plan through it twice
//! registers its stages twice.

pub mod holder;
pub mod join;
pub mod selection;

use std::sync::Arc;

use thiserror::Error;

pub use self::holder::{
    GroupedStreamHolder, GroupedTableHolder, Holder, KeyCodecFactory, StreamHolder, TableHolder,
};

use crate::catalog::{DataValue, GenericRow, SchemaError};
use crate::common::processing_log::{ProcessingLogContext, ProcessingLogger};
use crate::common::types::QueryId;
use crate::query::aggregate::builder as aggregate_builder;
use crate::query::codec::{CodecError, KeyCodec, ValueCodec};
use crate::query::expression::ExpressionError;
use crate::query::plan::{
    group_by_schema, join_schema, select_schema, AggregateStep, FilterStep, GroupByKeyStep, GroupByStep,
    QueryContext, SelectStep, SinkStep, SourceStep, StreamTableJoinStep, TableToStreamStep, WindowedAggregateStep,
};
use crate::query::sink::build_sink;
use crate::query::timestamp::TimestampError;
use crate::runtime::{RecordContext, RuntimeError, SourceSpec, TopologyBuilder, ValueMapper};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// A handler received a holder kind it cannot work with
    #[error("Invalid plan shape: {step} expects a {expected} input, got a {actual}")]
    InvalidPlanShape {
        step: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("Invalid window: {0}")]
    InvalidWindow(String),
    #[error("Unsupported aggregate: {0}")]
    UnsupportedAggregate(String),
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error("Join key mismatch between {left} and {right}")]
    JoinKeyMismatch { left: String, right: String },
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Lowers one plan into one topology
pub struct PlanBuilder<'a> {
    topology: &'a mut dyn TopologyBuilder,
    query_id: QueryId,
    processing_log: &'a ProcessingLogContext,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(topology: &'a mut dyn TopologyBuilder, query_id: QueryId, processing_log: &'a ProcessingLogContext) -> Self {
        PlanBuilder {
            topology,
            query_id,
            processing_log,
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub(crate) fn topology(&mut self) -> &mut dyn TopologyBuilder {
        &mut *self.topology
    }

    /// Processing logger of one step, named `<query id>.<context>`
    pub fn logger(&self, context: &QueryContext) -> Arc<ProcessingLogger> {
        self.processing_log
            .get_logger(&format!("{}.{}", self.query_id, context))
    }

    fn source_spec(step: &SourceStep) -> Result<SourceSpec> {
        let physical = &step.source_schema;
        Ok(SourceSpec {
            topic: step.topic.clone(),
            key_codec: KeyCodec::new(step.formats.key, physical, step.window),
            value_codec: ValueCodec::new(step.formats.value, physical, step.formats.options),
            timestamp_extractor: step.timestamp_policy.create(physical)?,
        })
    }

    pub fn visit_stream_source(&mut self, step: &SourceStep) -> Result<Holder> {
        let handle = self.topology.stream(Self::source_spec(step)?)?;
        let handle = self.topology.map_values(handle, add_meta_and_key_columns())?;
        Ok(Holder::Stream(StreamHolder {
            handle,
            schema: step.source_schema.with_meta_and_key_cols_in_value(),
            key_codec: KeyCodecFactory::for_window(step.window),
        }))
    }

    pub fn visit_table_source(&mut self, step: &SourceStep) -> Result<Holder> {
        let store_name = step.properties.context.store_name();
        let handle = self.topology.table(Self::source_spec(step)?, &store_name)?;
        let handle = self.topology.map_table_values(handle, add_meta_and_key_columns())?;
        Ok(Holder::Table(TableHolder {
            handle,
            schema: step.source_schema.with_meta_and_key_cols_in_value(),
            key_codec: KeyCodecFactory::for_window(step.window),
            materialization: None,
        }))
    }

    pub fn visit_stream_select(&mut self, source: Holder, step: &SelectStep) -> Result<Holder> {
        let stream = source.into_stream("StreamSelect")?;
        let schema = select_schema(&stream.schema, &step.select_expressions)?;
        let mapper = selection::select_mapper(&stream.schema, &step.select_expressions, self.logger(&step.properties.context))?;
        let handle = self.topology.map_values(stream.handle, mapper)?;
        Ok(Holder::Stream(StreamHolder {
            handle,
            schema,
            key_codec: stream.key_codec,
        }))
    }

    pub fn visit_stream_filter(&mut self, source: Holder, step: &FilterStep) -> Result<Holder> {
        let stream = source.into_stream("StreamFilter")?;
        let predicate = selection::filter_predicate(&stream.schema, &step.predicate, self.logger(&step.properties.context))?;
        let handle = self.topology.filter(stream.handle, predicate)?;
        Ok(Holder::Stream(StreamHolder { handle, ..stream }))
    }

    pub fn visit_stream_group_by(&mut self, source: Holder, step: &GroupByStep) -> Result<Holder> {
        let stream = source.into_stream("StreamGroupBy")?;
        let schema = group_by_schema(&stream.schema, &step.group_by_expressions)?;
        let selector = selection::group_by_selector(
            &stream.schema,
            &step.group_by_expressions,
            self.logger(&step.properties.context),
        )?;
        let handle = self.topology.group_stream(stream.handle, Some(selector))?;
        Ok(Holder::GroupedStream(GroupedStreamHolder { handle, schema }))
    }

    pub fn visit_stream_group_by_key(&mut self, source: Holder, _step: &GroupByKeyStep) -> Result<Holder> {
        let stream = source.into_stream("StreamGroupByKey")?;
        let handle = self.topology.group_stream(stream.handle, None)?;
        Ok(Holder::GroupedStream(GroupedStreamHolder {
            handle,
            schema: stream.schema,
        }))
    }

    pub fn visit_stream_aggregate(&mut self, source: Holder, step: &AggregateStep) -> Result<Holder> {
        let grouped = source.into_grouped_stream("StreamAggregate")?;
        aggregate_builder::build_aggregate(self, grouped, step).map(Holder::Table)
    }

    pub fn visit_stream_windowed_aggregate(&mut self, source: Holder, step: &WindowedAggregateStep) -> Result<Holder> {
        let grouped = source.into_grouped_stream("StreamWindowedAggregate")?;
        aggregate_builder::build_windowed_aggregate(self, grouped, step).map(Holder::Table)
    }

    pub fn visit_stream_table_join(&mut self, left: Holder, right: Holder, step: &StreamTableJoinStep) -> Result<Holder> {
        let stream = left.into_stream("StreamTableJoin")?;
        let table = right.into_table("StreamTableJoin")?;
        join::check_join_keys(&stream.schema, &table.schema)?;

        let schema = join_schema(&stream.schema, &table.schema, &step.left_alias, &step.right_alias)?;
        let joiner = join::value_joiner(table.schema.value().len());
        let handle = self
            .topology
            .stream_table_join(stream.handle, table.handle, joiner, step.join_type)?;
        Ok(Holder::Stream(StreamHolder {
            handle,
            schema,
            key_codec: stream.key_codec,
        }))
    }

    /// Returns the input holder so callers can still reach the sunk stream
    pub fn visit_stream_sink(&mut self, source: Holder, step: &SinkStep) -> Result<Holder> {
        let stream = source.into_stream("StreamSink")?;
        build_sink(
            &mut *self.topology,
            stream.handle,
            &stream.schema,
            stream.key_codec,
            &step.formats,
            &step.topic,
        )?;
        Ok(Holder::Stream(stream))
    }

    pub fn visit_table_select(&mut self, source: Holder, step: &SelectStep) -> Result<Holder> {
        let table = source.into_table("TableSelect")?;
        let schema = select_schema(&table.schema, &step.select_expressions)?;
        let mapper = selection::select_mapper(&table.schema, &step.select_expressions, self.logger(&step.properties.context))?;
        let handle = self.topology.map_table_values(table.handle, mapper.clone())?;
        let materialization = table.materialization.map(|m| m.project(mapper, schema.clone()));
        Ok(Holder::Table(TableHolder {
            handle,
            schema,
            key_codec: table.key_codec,
            materialization,
        }))
    }

    pub fn visit_table_filter(&mut self, source: Holder, step: &FilterStep) -> Result<Holder> {
        let table = source.into_table("TableFilter")?;
        let predicate = selection::filter_predicate(&table.schema, &step.predicate, self.logger(&step.properties.context))?;
        let handle = self.topology.filter_table(table.handle, predicate.clone())?;
        let materialization = table.materialization.map(|m| m.filter(predicate));
        Ok(Holder::Table(TableHolder {
            handle,
            materialization,
            ..table
        }))
    }

    pub fn visit_table_group_by(&mut self, source: Holder, step: &GroupByStep) -> Result<Holder> {
        let table = source.into_table("TableGroupBy")?;
        let schema = group_by_schema(&table.schema, &step.group_by_expressions)?;
        let selector = selection::group_by_selector(
            &table.schema,
            &step.group_by_expressions,
            self.logger(&step.properties.context),
        )?;
        let handle = self.topology.group_table(table.handle, selector)?;
        Ok(Holder::GroupedTable(GroupedTableHolder { handle, schema }))
    }

    pub fn visit_table_aggregate(&mut self, source: Holder, step: &AggregateStep) -> Result<Holder> {
        let grouped = source.into_grouped_table("TableAggregate")?;
        aggregate_builder::build_table_aggregate(self, grouped, step).map(Holder::Table)
    }

    pub fn visit_table_to_stream(&mut self, source: Holder, _step: &TableToStreamStep) -> Result<Holder> {
        let table = source.into_table("TableToStream")?;
        let handle = self.topology.to_change_stream(table.handle)?;
        Ok(Holder::Stream(StreamHolder {
            handle,
            schema: table.schema,
            key_codec: table.key_codec,
        }))
    }

    /// Returns the input holder, whose materialization the query exposes
    pub fn visit_table_sink(&mut self, source: Holder, step: &SinkStep) -> Result<Holder> {
        let table = source.into_table("TableSink")?;
        let changes = self.topology.to_change_stream(table.handle)?;
        build_sink(
            &mut *self.topology,
            changes,
            &table.schema,
            table.key_codec,
            &step.formats,
            &step.topic,
        )?;
        Ok(Holder::Table(table))
    }
}

/// Prepend ROWTIME and the key values to a source row
fn add_meta_and_key_columns() -> ValueMapper {
    Arc::new(|ctx: &RecordContext<'_>, row: Option<GenericRow>| {
        let row = row?;
        let mut values = Vec::with_capacity(1 + ctx.key.values().len() + row.len());
        values.push(DataValue::Integer(ctx.timestamp));
        values.extend(ctx.key.values().iter().cloned());
        values.extend(row.into_values());
        Some(GenericRow::new(values))
    })
}
