// Statements
//
// The statement forms the engine executes. Statements reach the engine
// already analysed: column references are resolved names, and aggregate
// calls are separated from scalar projections. The command log stores them
// as JSON text.

use serde::{Deserialize, Serialize};

use crate::catalog::SqlType;
use crate::common::types::{DataSourceType, QueryId};
use crate::query::aggregate::AggregateCall;
use crate::query::expression::Expression;
use crate::query::plan::{Formats, JoinType, WindowExpression, WindowInfo};
use crate::query::timestamp::TimestampColumn;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        ColumnDef {
            name: name.into(),
            sql_type,
        }
    }
}

/// CREATE STREAM / CREATE TABLE over an existing topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSource {
    pub source_type: DataSourceType,
    pub name: String,
    pub key: Vec<ColumnDef>,
    pub value: Vec<ColumnDef>,
    pub topic: String,
    #[serde(default)]
    pub formats: Formats,
    #[serde(default)]
    pub timestamp_column: Option<TimestampColumn>,
    /// Set when the topic holds windowed keys
    #[serde(default)]
    pub window: Option<WindowInfo>,
    #[serde(default)]
    pub if_not_exists: bool,
}

/// One item of a SELECT list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectItem {
    Scalar { alias: String, expression: Expression },
    Aggregate { alias: String, call: AggregateCall },
}

impl SelectItem {
    pub fn scalar(alias: impl Into<String>, expression: Expression) -> Self {
        SelectItem::Scalar {
            alias: alias.into(),
            expression,
        }
    }

    pub fn aggregate(alias: impl Into<String>, call: AggregateCall) -> Self {
        SelectItem::Aggregate {
            alias: alias.into(),
            call,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            SelectItem::Scalar { alias, .. } | SelectItem::Aggregate { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinClause {
    /// Right-hand side; must be a table
    pub table: String,
    pub join_type: JoinType,
}

/// A continuous SELECT.
///
/// After a join, value columns are addressed as `<SOURCE>_<COLUMN>`. HAVING
/// refers to the aliases of the SELECT list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    pub from: String,
    #[serde(default)]
    pub join: Option<JoinClause>,
    #[serde(default)]
    pub filter: Option<Expression>,
    #[serde(default)]
    pub group_by: Vec<Expression>,
    #[serde(default)]
    pub window: Option<WindowExpression>,
    pub select: Vec<SelectItem>,
    #[serde(default)]
    pub having: Option<Expression>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(from: impl Into<String>, select: Vec<SelectItem>) -> Self {
        QuerySpec {
            from: from.into(),
            join: None,
            filter: None,
            group_by: Vec::new(),
            window: None,
            select,
            having: None,
            limit: None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || self.select.iter().any(|s| matches!(s, SelectItem::Aggregate { .. }))
    }
}

/// CREATE STREAM AS SELECT / CREATE TABLE AS SELECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAsSelect {
    pub sink_type: DataSourceType,
    pub name: String,
    /// Defaults to the sink name
    #[serde(default)]
    pub topic: Option<String>,
    /// Defaults to the formats of the FROM source
    #[serde(default)]
    pub formats: Option<Formats>,
    pub query: QuerySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertInto {
    pub sink: String,
    pub query: QuerySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    CreateSource(CreateSource),
    CreateAsSelect(CreateAsSelect),
    InsertInto(InsertInto),
    /// A transient query, never written to the command log
    Query(QuerySpec),
    DropSource { source_type: DataSourceType, name: String },
    TerminateQuery { query_id: QueryId },
    /// Legacy script; the statements travel in the command's properties
    RunScript,
}

impl Statement {
    pub fn parse(text: &str) -> serde_json::Result<Statement> {
        serde_json::from_str(text)
    }

    /// A script is a JSON array of statements
    pub fn parse_script(text: &str) -> serde_json::Result<Vec<Statement>> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // every field serializes to plain JSON
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Number of persistent queries executing this statement starts
    pub fn persistent_query_count(&self) -> usize {
        match self {
            Statement::CreateAsSelect(_) | Statement::InsertInto(_) => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::aggregate::AggregateFunction;

    #[test]
    fn test_statement_json_shape() {
        let text = r#"{
            "type": "create_as_select",
            "sink_type": "Table",
            "name": "COUNTS",
            "query": {
                "from": "ORDERS",
                "group_by": [{"Column": "ITEM"}],
                "select": [
                    {"kind": "scalar", "alias": "ITEM", "expression": {"Column": "ITEM"}},
                    {"kind": "aggregate", "alias": "N", "call": {"function": "Count", "argument": null}}
                ]
            }
        }"#;
        let statement = Statement::parse(text).unwrap();
        let Statement::CreateAsSelect(csas) = &statement else {
            panic!("expected create_as_select, got {:?}", statement);
        };
        assert_eq!(csas.sink_type, DataSourceType::Table);
        assert!(csas.query.is_aggregate());
        assert_eq!(
            csas.query.select[1],
            SelectItem::aggregate("N", AggregateCall::new(AggregateFunction::Count, None))
        );
        assert_eq!(statement.persistent_query_count(), 1);
        assert_eq!(Statement::parse(&statement.to_text()).unwrap(), statement);
    }

    #[test]
    fn test_script_is_array() {
        let script = Statement::parse_script(r#"[{"type": "run_script"}, {"type": "drop_source", "source_type": "Stream", "name": "S"}]"#)
            .unwrap();
        assert_eq!(script.len(), 2);
        assert!(Statement::parse("not json").is_err());
    }
}
