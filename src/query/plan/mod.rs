// Execution Plan Model
//
// An execution plan is a tree of steps. Each step owns its children, its
// serialization formats and a stable query-context path that names its
// state stores and log lines. Steps are plain data: the only behaviour here
// is schema derivation and dispatch into the plan builder.

pub mod formats;
pub mod window;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::formats::{Format, Formats, SerdeOptions};
pub use self::window::{WindowExpression, WindowInfo};

use crate::catalog::{LogicalSchema, SqlType};
use crate::query::aggregate::function::AggregateCall;
use crate::query::aggregate::params::aggregate_schemas;
use crate::query::builder::{Holder, PlanBuilder, PlanError};
use crate::query::expression::Expression;
use crate::query::timestamp::TimestampPolicy;

/// Path-like identifier of a step within a query, e.g. `Aggregate/GroupBy`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryContext {
    path: Vec<String>,
}

impl QueryContext {
    pub fn new(path: &[&str]) -> Self {
        QueryContext {
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A child context one level below this one
    pub fn push(&self, name: &str) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        QueryContext { path }
    }

    /// Name of the state store backing this step
    pub fn store_name(&self) -> String {
        self.to_string().replace('/', "-")
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join("/"))
    }
}

/// Properties common to every step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepProperties {
    pub context: QueryContext,
}

impl StepProperties {
    pub fn new(context: QueryContext) -> Self {
        StepProperties { context }
    }
}

/// One projected column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectExpression {
    pub alias: String,
    pub expression: Expression,
}

impl SelectExpression {
    pub fn new(alias: impl Into<String>, expression: Expression) -> Self {
        SelectExpression {
            alias: alias.into(),
            expression,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceStep {
    pub properties: StepProperties,
    pub topic: String,
    pub formats: Formats,
    /// Schema as declared on the source, without meta or key copies
    pub source_schema: LogicalSchema,
    pub timestamp_policy: TimestampPolicy,
    pub window: Option<WindowInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub select_expressions: Vec<SelectExpression>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub predicate: Expression,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupByStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub formats: Formats,
    pub group_by_expressions: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupByKeyStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub formats: Formats,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub formats: Formats,
    /// Input columns copied unchanged into the aggregate record
    pub non_aggregate_columns: Vec<String>,
    pub aggregations: Vec<AggregateCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowedAggregateStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub formats: Formats,
    pub non_aggregate_columns: Vec<String>,
    pub aggregations: Vec<AggregateCall>,
    pub window: WindowExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamTableJoinStep {
    pub properties: StepProperties,
    pub left: Box<ExecutionStep>,
    pub right: Box<ExecutionStep>,
    pub join_type: JoinType,
    pub left_alias: String,
    pub right_alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
    pub formats: Formats,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableToStreamStep {
    pub properties: StepProperties,
    pub source: Box<ExecutionStep>,
}

/// A node of the execution plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStep {
    StreamSource(SourceStep),
    TableSource(SourceStep),
    StreamSelect(SelectStep),
    StreamFilter(FilterStep),
    StreamGroupBy(GroupByStep),
    StreamGroupByKey(GroupByKeyStep),
    StreamAggregate(AggregateStep),
    StreamWindowedAggregate(WindowedAggregateStep),
    StreamTableJoin(StreamTableJoinStep),
    StreamSink(SinkStep),
    TableSelect(SelectStep),
    TableFilter(FilterStep),
    TableGroupBy(GroupByStep),
    TableAggregate(AggregateStep),
    TableToStream(TableToStreamStep),
    TableSink(SinkStep),
}

impl ExecutionStep {
    /// Short name of the step kind, used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionStep::StreamSource(_) => "StreamSource",
            ExecutionStep::TableSource(_) => "TableSource",
            ExecutionStep::StreamSelect(_) => "StreamSelect",
            ExecutionStep::StreamFilter(_) => "StreamFilter",
            ExecutionStep::StreamGroupBy(_) => "StreamGroupBy",
            ExecutionStep::StreamGroupByKey(_) => "StreamGroupByKey",
            ExecutionStep::StreamAggregate(_) => "StreamAggregate",
            ExecutionStep::StreamWindowedAggregate(_) => "StreamWindowedAggregate",
            ExecutionStep::StreamTableJoin(_) => "StreamTableJoin",
            ExecutionStep::StreamSink(_) => "StreamSink",
            ExecutionStep::TableSelect(_) => "TableSelect",
            ExecutionStep::TableFilter(_) => "TableFilter",
            ExecutionStep::TableGroupBy(_) => "TableGroupBy",
            ExecutionStep::TableAggregate(_) => "TableAggregate",
            ExecutionStep::TableToStream(_) => "TableToStream",
            ExecutionStep::TableSink(_) => "TableSink",
        }
    }

    pub fn properties(&self) -> &StepProperties {
        match self {
            ExecutionStep::StreamSource(s) | ExecutionStep::TableSource(s) => &s.properties,
            ExecutionStep::StreamSelect(s) | ExecutionStep::TableSelect(s) => &s.properties,
            ExecutionStep::StreamFilter(s) | ExecutionStep::TableFilter(s) => &s.properties,
            ExecutionStep::StreamGroupBy(s) | ExecutionStep::TableGroupBy(s) => &s.properties,
            ExecutionStep::StreamGroupByKey(s) => &s.properties,
            ExecutionStep::StreamAggregate(s) | ExecutionStep::TableAggregate(s) => &s.properties,
            ExecutionStep::StreamWindowedAggregate(s) => &s.properties,
            ExecutionStep::StreamTableJoin(s) => &s.properties,
            ExecutionStep::StreamSink(s) | ExecutionStep::TableSink(s) => &s.properties,
            ExecutionStep::TableToStream(s) => &s.properties,
        }
    }

    /// Ordered child steps
    pub fn sources(&self) -> Vec<&ExecutionStep> {
        match self {
            ExecutionStep::StreamSource(_) | ExecutionStep::TableSource(_) => Vec::new(),
            ExecutionStep::StreamSelect(s) | ExecutionStep::TableSelect(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamFilter(s) | ExecutionStep::TableFilter(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamGroupBy(s) | ExecutionStep::TableGroupBy(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamGroupByKey(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamAggregate(s) | ExecutionStep::TableAggregate(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamWindowedAggregate(s) => vec![s.source.as_ref()],
            ExecutionStep::StreamTableJoin(s) => vec![s.left.as_ref(), s.right.as_ref()],
            ExecutionStep::StreamSink(s) | ExecutionStep::TableSink(s) => vec![s.source.as_ref()],
            ExecutionStep::TableToStream(s) => vec![s.source.as_ref()],
        }
    }

    /// Topics read by the source steps of this plan
    pub fn source_topics(&self) -> Vec<String> {
        match self {
            ExecutionStep::StreamSource(s) | ExecutionStep::TableSource(s) => vec![s.topic.clone()],
            _ => self.sources().into_iter().flat_map(|s| s.source_topics()).collect(),
        }
    }

    /// Derive this step's output schema from its children
    pub fn schema(&self) -> Result<LogicalSchema, PlanError> {
        match self {
            ExecutionStep::StreamSource(s) | ExecutionStep::TableSource(s) => {
                Ok(s.source_schema.with_meta_and_key_cols_in_value())
            }
            ExecutionStep::StreamSelect(s) | ExecutionStep::TableSelect(s) => {
                select_schema(&s.source.schema()?, &s.select_expressions)
            }
            ExecutionStep::StreamFilter(s) | ExecutionStep::TableFilter(s) => s.source.schema(),
            ExecutionStep::StreamGroupBy(s) | ExecutionStep::TableGroupBy(s) => {
                group_by_schema(&s.source.schema()?, &s.group_by_expressions)
            }
            ExecutionStep::StreamGroupByKey(s) => s.source.schema(),
            ExecutionStep::StreamAggregate(s) | ExecutionStep::TableAggregate(s) => {
                let (_, schema) = aggregate_schemas(&s.source.schema()?, &s.non_aggregate_columns, &s.aggregations)?;
                Ok(schema)
            }
            ExecutionStep::StreamWindowedAggregate(s) => {
                let (_, schema) = aggregate_schemas(&s.source.schema()?, &s.non_aggregate_columns, &s.aggregations)?;
                Ok(schema)
            }
            ExecutionStep::StreamTableJoin(s) => {
                join_schema(&s.left.schema()?, &s.right.schema()?, &s.left_alias, &s.right_alias)
            }
            ExecutionStep::StreamSink(s) | ExecutionStep::TableSink(s) => s.source.schema(),
            ExecutionStep::TableToStream(s) => s.source.schema(),
        }
    }

    /// Lower this step, children first, into runtime calls
    pub fn build(&self, builder: &mut PlanBuilder<'_>) -> Result<Holder, PlanError> {
        match self {
            ExecutionStep::StreamSource(step) => builder.visit_stream_source(step),
            ExecutionStep::TableSource(step) => builder.visit_table_source(step),
            ExecutionStep::StreamSelect(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_select(source, step)
            }
            ExecutionStep::StreamFilter(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_filter(source, step)
            }
            ExecutionStep::StreamGroupBy(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_group_by(source, step)
            }
            ExecutionStep::StreamGroupByKey(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_group_by_key(source, step)
            }
            ExecutionStep::StreamAggregate(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_aggregate(source, step)
            }
            ExecutionStep::StreamWindowedAggregate(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_windowed_aggregate(source, step)
            }
            ExecutionStep::StreamTableJoin(step) => {
                let left = step.left.build(builder)?;
                let right = step.right.build(builder)?;
                builder.visit_stream_table_join(left, right, step)
            }
            ExecutionStep::StreamSink(step) => {
                let source = step.source.build(builder)?;
                builder.visit_stream_sink(source, step)
            }
            ExecutionStep::TableSelect(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_select(source, step)
            }
            ExecutionStep::TableFilter(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_filter(source, step)
            }
            ExecutionStep::TableGroupBy(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_group_by(source, step)
            }
            ExecutionStep::TableAggregate(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_aggregate(source, step)
            }
            ExecutionStep::TableToStream(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_to_stream(source, step)
            }
            ExecutionStep::TableSink(step) => {
                let source = step.source.build(builder)?;
                builder.visit_table_sink(source, step)
            }
        }
    }

    /// Indented one-line-per-step rendering of the plan
    pub fn summary(&self) -> String {
        let mut out = String::new();
        self.write_summary(0, &mut out);
        out
    }

    fn write_summary(&self, depth: usize, out: &mut String) {
        let schema = self.schema().map(|s| s.to_string()).unwrap_or_else(|e| format!("<{}>", e));
        out.push_str(&format!(
            "{}> [ {} ] | Schema: {} | Context: {}\n",
            " ".repeat(depth * 2),
            self.kind(),
            schema,
            self.properties().context
        ));
        for child in self.sources() {
            child.write_summary(depth + 1, out);
        }
    }
}

pub(crate) fn select_schema(source: &LogicalSchema, selects: &[SelectExpression]) -> Result<LogicalSchema, PlanError> {
    let mut builder = LogicalSchema::builder();
    for key in source.key() {
        builder = builder.key_column(key.name(), key.sql_type());
    }
    for select in selects {
        let sql_type = select.expression.result_type(source)?;
        builder = builder.value_column(select.alias.clone(), sql_type);
    }
    Ok(builder.build_allowing_key_copies()?)
}

/// Name given to the key column produced by a group-by expression
pub fn group_by_column_name(expression: &Expression, index: usize) -> String {
    match expression {
        Expression::Column(name) => name.clone(),
        _ => format!("KSQL_COL_{}", index),
    }
}

pub(crate) fn group_by_schema(source: &LogicalSchema, expressions: &[Expression]) -> Result<LogicalSchema, PlanError> {
    let mut key: Vec<(String, SqlType)> = Vec::with_capacity(expressions.len());
    for (i, expression) in expressions.iter().enumerate() {
        key.push((group_by_column_name(expression, i), expression.result_type(source)?));
    }
    Ok(source.with_key(key)?)
}

pub(crate) fn join_schema(
    left: &LogicalSchema,
    right: &LogicalSchema,
    left_alias: &str,
    right_alias: &str,
) -> Result<LogicalSchema, PlanError> {
    let mut builder = LogicalSchema::builder();
    for key in left.key() {
        builder = builder.key_column(key.name(), key.sql_type());
    }
    for (alias, schema) in [(left_alias, left), (right_alias, right)] {
        for col in schema.value() {
            builder = builder.value_column(format!("{}_{}", alias, col.name()), col.sql_type());
        }
    }
    Ok(builder.build_allowing_key_copies()?.with_meta_and_key_cols_in_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataValue;
    use crate::query::aggregate::function::AggregateFunction;
    use crate::query::expression::BinaryOperator;

    fn source_step() -> ExecutionStep {
        ExecutionStep::StreamSource(SourceStep {
            properties: StepProperties::new(QueryContext::new(&["KsqlTopic", "Source"])),
            topic: "orders".into(),
            formats: Formats::default(),
            source_schema: LogicalSchema::builder()
                .key_column("ID", SqlType::BigInt)
                .value_column("ITEM", SqlType::String)
                .value_column("PRICE", SqlType::Double)
                .build()
                .unwrap(),
            timestamp_policy: TimestampPolicy::Metadata,
            window: None,
        })
    }

    #[test]
    fn test_store_name_from_context() {
        let ctx = QueryContext::new(&["Aggregate"]).push("GroupBy");
        assert_eq!(ctx.to_string(), "Aggregate/GroupBy");
        assert_eq!(ctx.store_name(), "Aggregate-GroupBy");
    }

    #[test]
    fn test_select_schema_derivation_is_deterministic() {
        let select = ExecutionStep::StreamSelect(SelectStep {
            properties: StepProperties::new(QueryContext::new(&["Project"])),
            source: Box::new(source_step()),
            select_expressions: vec![
                SelectExpression::new("ID", Expression::column("ID")),
                SelectExpression::new(
                    "DOUBLED",
                    Expression::binary(Expression::column("PRICE"), BinaryOperator::Multiply, Expression::literal(DataValue::Integer(2))),
                ),
            ],
        });

        let schema = select.schema().unwrap();
        assert_eq!(schema, select.schema().unwrap());
        assert_eq!(schema.key()[0].name(), "ID");
        assert_eq!(schema.find_value_column("DOUBLED").unwrap().sql_type(), SqlType::Double);
    }

    #[test]
    fn test_group_by_rekeys() {
        let group_by = ExecutionStep::StreamGroupBy(GroupByStep {
            properties: StepProperties::new(QueryContext::new(&["Aggregate", "GroupBy"])),
            source: Box::new(source_step()),
            formats: Formats::default(),
            group_by_expressions: vec![Expression::column("ITEM")],
        });
        let schema = group_by.schema().unwrap();
        assert_eq!(schema.key().len(), 1);
        assert_eq!(schema.key()[0].name(), "ITEM");
    }

    #[test]
    fn test_structural_equality() {
        let agg = |f| {
            ExecutionStep::StreamAggregate(AggregateStep {
                properties: StepProperties::new(QueryContext::new(&["Aggregate"])),
                source: Box::new(source_step()),
                formats: Formats::default(),
                non_aggregate_columns: vec!["ID".into()],
                aggregations: vec![AggregateCall::new(f, Some("PRICE"))],
            })
        };
        assert_eq!(agg(AggregateFunction::Sum), agg(AggregateFunction::Sum));
        assert_ne!(agg(AggregateFunction::Sum), agg(AggregateFunction::Max));
        assert_eq!(agg(AggregateFunction::Sum).sources().len(), 1);
    }
}
