// Query Planner
//
// Turns a SELECT into an execution plan. Steps are stacked in a fixed order:
//
//   source -> join -> WHERE -> GROUP BY -> aggregate -> projection -> HAVING
//
// and a sink is added on top for persistent queries. Each step gets a
// stable context path so store names and processing-log names come out the
// same every time the same statement is planned.

use log::debug;

use crate::catalog::{DataSource, LogicalSchema, MetaStore};
use crate::common::types::DataSourceType;
use crate::query::aggregate::{aggregate_column_name, AggregateCall};
use crate::query::builder::PlanError;
use crate::query::expression::Expression;
use crate::query::plan::{
    AggregateStep, ExecutionStep, FilterStep, Formats, GroupByKeyStep, GroupByStep, QueryContext, SelectExpression,
    SelectStep, SinkStep, SourceStep, StepProperties, StreamTableJoinStep, WindowInfo, WindowedAggregateStep,
};
use crate::query::timestamp::TimestampPolicy;

use super::statement::{QuerySpec, SelectItem};
use super::{EngineError, Result};

/// A planned SELECT, not yet bound to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuery {
    pub plan: ExecutionStep,
    pub result_type: DataSourceType,
    /// Output schema, including ROWTIME and key copies in the value
    pub schema: LogicalSchema,
    /// Names of the sources read, FROM source first
    pub sources: Vec<String>,
    /// Windowing of the output keys
    pub window: Option<WindowInfo>,
    /// Formats of the FROM source
    pub source_formats: Formats,
    pub limit: Option<usize>,
}

impl PlannedQuery {
    /// Schema of rows as written to a sink topic
    pub fn sink_schema(&self) -> LogicalSchema {
        self.schema.without_meta_and_key_cols_in_value()
    }

    /// Wrap the plan in the sink step matching its result type
    pub fn into_sink_plan(self, topic: &str, formats: Formats) -> ExecutionStep {
        let step = SinkStep {
            properties: props(&["Sink"]),
            source: Box::new(self.plan),
            formats,
            topic: topic.to_string(),
        };
        match self.result_type {
            DataSourceType::Stream => ExecutionStep::StreamSink(step),
            DataSourceType::Table => ExecutionStep::TableSink(step),
        }
    }
}

fn props(path: &[&str]) -> StepProperties {
    StepProperties::new(QueryContext::new(path))
}

fn user(message: impl Into<String>) -> EngineError {
    EngineError::UserStatement(message.into())
}

pub struct QueryPlanner<'a> {
    metastore: &'a MetaStore,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(metastore: &'a MetaStore) -> Self {
        QueryPlanner { metastore }
    }

    fn source(&self, name: &str) -> Result<std::sync::Arc<DataSource>> {
        self.metastore
            .get_source(name)
            .ok_or_else(|| user(format!("{} does not exist.", name)))
    }

    pub fn plan(&self, query: &QuerySpec) -> Result<PlannedQuery> {
        let from = self.source(&query.from)?;
        let mut sources = vec![from.name.clone()];
        let mut current = source_step(&from)?;
        let mut result_type = from.source_type;

        if let Some(join) = &query.join {
            let table = self.source(&join.table)?;
            if from.source_type != DataSourceType::Stream {
                return Err(user(format!(
                    "Only stream-table joins are supported, {} is a {}",
                    from.name, from.source_type
                )));
            }
            if table.source_type != DataSourceType::Table {
                return Err(user(format!(
                    "The right side of a join must be a TABLE, {} is a {}",
                    table.name, table.source_type
                )));
            }
            current = ExecutionStep::StreamTableJoin(StreamTableJoinStep {
                properties: props(&["Join"]),
                left: Box::new(current),
                right: Box::new(source_step(&table)?),
                join_type: join.join_type,
                left_alias: from.name.clone(),
                right_alias: table.name.clone(),
            });
            sources.push(table.name.clone());
        }

        if let Some(predicate) = &query.filter {
            let step = FilterStep {
                properties: props(&["WhereFilter"]),
                source: Box::new(current),
                predicate: predicate.clone(),
            };
            current = match result_type {
                DataSourceType::Stream => ExecutionStep::StreamFilter(step),
                DataSourceType::Table => ExecutionStep::TableFilter(step),
            };
        }

        let window = if query.is_aggregate() {
            current = plan_aggregation(current, result_type, query, from.formats)?;
            result_type = DataSourceType::Table;
            query.window.map(|w| w.window_info())
        } else {
            if query.window.is_some() {
                return Err(user("WINDOW clause requires an aggregate query with GROUP BY"));
            }
            if query.having.is_some() {
                return Err(user("HAVING clause requires an aggregate query with GROUP BY"));
            }
            current = plan_projection(current, result_type, &query.select)?;
            from.window_info
        };

        let schema = current.schema()?;
        debug!("Planned query over {:?}:\n{}", sources, current.summary());
        Ok(PlannedQuery {
            plan: current,
            result_type,
            schema,
            sources,
            window,
            source_formats: from.formats,
            limit: query.limit,
        })
    }
}

fn source_step(source: &DataSource) -> Result<ExecutionStep> {
    let timestamp_policy =
        TimestampPolicy::for_source(source.timestamp_column.as_ref(), &source.schema).map_err(PlanError::from)?;
    let step = SourceStep {
        properties: props(&["Source", source.name.as_str()]),
        topic: source.topic.clone(),
        formats: source.formats,
        source_schema: source.schema.clone(),
        timestamp_policy,
        window: source.window_info,
    };
    Ok(match source.source_type {
        DataSourceType::Stream => ExecutionStep::StreamSource(step),
        DataSourceType::Table => ExecutionStep::TableSource(step),
    })
}

fn plan_projection(source: ExecutionStep, result_type: DataSourceType, select: &[SelectItem]) -> Result<ExecutionStep> {
    let mut expressions = Vec::with_capacity(select.len());
    for item in select {
        match item {
            SelectItem::Scalar { alias, expression } => {
                expressions.push(SelectExpression::new(alias.clone(), expression.clone()))
            }
            SelectItem::Aggregate { alias, .. } => {
                return Err(user(format!("Aggregate {} requires a GROUP BY clause", alias)));
            }
        }
    }
    let step = SelectStep {
        properties: props(&["Project"]),
        source: Box::new(source),
        select_expressions: expressions,
    };
    Ok(match result_type {
        DataSourceType::Stream => ExecutionStep::StreamSelect(step),
        DataSourceType::Table => ExecutionStep::TableSelect(step),
    })
}

/// Group-by on exactly the current key columns needs no re-keying
fn is_key_grouping(schema: &LogicalSchema, group_by: &[Expression]) -> bool {
    group_by.len() == schema.key().len()
        && group_by
            .iter()
            .zip(schema.key())
            .all(|(e, k)| matches!(e, Expression::Column(name) if name == k.name()))
}

/// Columns read by the scalar select items, each of which must be grouped on
fn non_aggregate_columns(query: &QuerySpec) -> Result<Vec<String>> {
    let grouped: Vec<&str> = query.group_by.iter().flat_map(|e| e.referenced_columns()).collect();
    let mut columns: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();
    for item in &query.select {
        if let SelectItem::Scalar { expression, .. } = item {
            for column in expression.referenced_columns() {
                if !grouped.contains(&column) {
                    if !missing.iter().any(|m| m == column) {
                        missing.push(column.to_string());
                    }
                } else if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(user(format!(
            "Non-aggregate SELECT expression(s) not part of GROUP BY: [{}]",
            missing.join(", ")
        )));
    }
    Ok(columns)
}

fn plan_aggregation(
    source: ExecutionStep,
    source_type: DataSourceType,
    query: &QuerySpec,
    formats: Formats,
) -> Result<ExecutionStep> {
    if query.group_by.is_empty() {
        return Err(user("Aggregate query needs a GROUP BY clause"));
    }
    let calls: Vec<AggregateCall> = query
        .select
        .iter()
        .filter_map(|item| match item {
            SelectItem::Aggregate { call, .. } => Some(call.clone()),
            SelectItem::Scalar { .. } => None,
        })
        .collect();
    if calls.is_empty() {
        return Err(user("GROUP BY requires at least one aggregate function in the SELECT list"));
    }
    let non_aggregate_columns = non_aggregate_columns(query)?;
    let source_schema = source.schema()?;

    let group_props = props(&["Aggregate", "GroupBy"]);
    let grouped = match source_type {
        DataSourceType::Table => {
            if query.window.is_some() {
                return Err(user("Windowed aggregation is not supported on a TABLE"));
            }
            ExecutionStep::TableGroupBy(GroupByStep {
                properties: group_props,
                source: Box::new(source),
                formats,
                group_by_expressions: query.group_by.clone(),
            })
        }
        DataSourceType::Stream if is_key_grouping(&source_schema, &query.group_by) => {
            ExecutionStep::StreamGroupByKey(GroupByKeyStep {
                properties: group_props,
                source: Box::new(source),
                formats,
            })
        }
        DataSourceType::Stream => ExecutionStep::StreamGroupBy(GroupByStep {
            properties: group_props,
            source: Box::new(source),
            formats,
            group_by_expressions: query.group_by.clone(),
        }),
    };

    let aggregate_props = props(&["Aggregate", "Aggregate", "Materialize"]);
    let aggregated = match (source_type, query.window) {
        (DataSourceType::Stream, Some(window)) => {
            window.validate().map_err(|e| user(format!("Invalid window: {}", e)))?;
            ExecutionStep::StreamWindowedAggregate(WindowedAggregateStep {
                properties: aggregate_props,
                source: Box::new(grouped),
                formats,
                non_aggregate_columns,
                aggregations: calls,
                window,
            })
        }
        (DataSourceType::Stream, None) => ExecutionStep::StreamAggregate(AggregateStep {
            properties: aggregate_props,
            source: Box::new(grouped),
            formats,
            non_aggregate_columns,
            aggregations: calls,
        }),
        (DataSourceType::Table, _) => {
            if let Some(call) = calls.iter().find(|c| !c.function.supports_undo()) {
                return Err(user(format!(
                    "{} is not supported in a TABLE aggregation: it cannot undo a previous value",
                    call.function
                )));
            }
            ExecutionStep::TableAggregate(AggregateStep {
                properties: aggregate_props,
                source: Box::new(grouped),
                formats,
                non_aggregate_columns,
                aggregations: calls,
            })
        }
    };

    let mut aggregate_index = 0;
    let mut expressions = Vec::with_capacity(query.select.len());
    for item in &query.select {
        match item {
            SelectItem::Scalar { alias, expression } => {
                expressions.push(SelectExpression::new(alias.clone(), expression.clone()))
            }
            SelectItem::Aggregate { alias, .. } => {
                expressions.push(SelectExpression::new(
                    alias.clone(),
                    Expression::column(aggregate_column_name(aggregate_index)),
                ));
                aggregate_index += 1;
            }
        }
    }
    let mut current = ExecutionStep::TableSelect(SelectStep {
        properties: props(&["Aggregate", "Project"]),
        source: Box::new(aggregated),
        select_expressions: expressions,
    });

    if let Some(having) = &query.having {
        current = ExecutionStep::TableFilter(FilterStep {
            properties: props(&["Aggregate", "HavingFilter"]),
            source: Box::new(current),
            predicate: having.clone(),
        });
    }
    Ok(current)
}
