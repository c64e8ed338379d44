use anyhow::Result;
use bayunstream::catalog::{DataValue, SqlType};
use bayunstream::common::types::DataSourceType;
use bayunstream::engine::statement::{QuerySpec, SelectItem};
use bayunstream::engine::EngineError;
use bayunstream::query::aggregate::{AggregateCall, AggregateFunction};
use bayunstream::query::expression::{BinaryOperator, Expression};

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn item_totals() -> QuerySpec {
    let mut query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::aggregate("N", AggregateCall::new(AggregateFunction::Count, None)),
            SelectItem::aggregate("TOTAL", AggregateCall::new(AggregateFunction::Sum, Some("PRICE"))),
            SelectItem::aggregate("AVG_PRICE", AggregateCall::new(AggregateFunction::Avg, Some("PRICE"))),
        ],
    );
    query.group_by = vec![Expression::column("ITEM")];
    query
}

fn create_accounts() -> bayunstream::engine::Statement {
    create_source(
        DataSourceType::Table,
        "ACCOUNTS",
        "accounts",
        &[("ID", SqlType::BigInt)],
        &[("REGION", SqlType::String), ("BALANCE", SqlType::Double)],
    )
}

fn region_totals(functions: &[(&str, AggregateFunction)]) -> QuerySpec {
    let mut select = vec![SelectItem::scalar("REGION", Expression::column("REGION"))];
    for (alias, function) in functions {
        let argument = match function {
            AggregateFunction::Count => None,
            _ => Some("BALANCE"),
        };
        select.push(SelectItem::aggregate(*alias, AggregateCall::new(*function, argument)));
    }
    let mut query = QuerySpec::new("ACCOUNTS", select);
    query.group_by = vec![Expression::column("REGION")];
    query
}

#[test]
fn test_group_by_rekeys_and_aggregates() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Table, "ITEM_TOTALS", item_totals()))?;
    result.persistent().expect("persistent query").start()?;

    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "2", &order("pear", 3.0), 110);
    node.produce("orders", "3", &order("apple", 4.0), 120);

    let records = node.await_records("ITEM_TOTALS", 3);
    assert_eq!(records.len(), 3);
    assert_eq!(json(&records[0].key)?, serde_json::json!("apple"));
    assert_eq!(json(&records[1].key)?, serde_json::json!("pear"));
    assert_eq!(
        json(&records[2].value)?,
        serde_json::json!({"N": 2, "TOTAL": 6.0, "AVG_PRICE": 3.0})
    );
    assert_eq!(records[2].timestamp, 120);
    Ok(())
}

#[test]
fn test_having_filters_groups() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let mut query = item_totals();
    query.having = Some(Expression::binary(
        Expression::column("N"),
        BinaryOperator::GreaterThan,
        Expression::literal(DataValue::Integer(1)),
    ));
    let result = node.execute(&create_as_select(DataSourceType::Table, "POPULAR", query))?;
    result.persistent().expect("persistent query").start()?;

    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "2", &order("pear", 3.0), 110);
    node.produce("orders", "3", &order("apple", 4.0), 120);

    let records = node.await_records("POPULAR", 1);
    assert!(!records.is_empty());
    assert_eq!(json(&records.last().expect("one record").key)?, serde_json::json!("apple"));
    Ok(())
}

#[test]
fn test_table_aggregate_retracts_moved_rows() -> Result<()> {
    let node = node()?;
    node.execute(&create_accounts())?;
    let result = node.execute(&create_as_select(
        DataSourceType::Table,
        "REGIONS",
        region_totals(&[("N", AggregateFunction::Count), ("TOTAL", AggregateFunction::Sum)]),
    ))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    node.produce("accounts", "1", r#"{"REGION":"eu","BALANCE":10.0}"#, 100);
    node.produce("accounts", "2", r#"{"REGION":"eu","BALANCE":5.0}"#, 110);
    node.produce("accounts", "1", r#"{"REGION":"us","BALANCE":10.0}"#, 120);

    let provider = query.materialization().expect("aggregation is materialized");
    let us = eventually(TIMEOUT, || provider.get(&[text_value("us")]).ok().flatten()).expect("us row");
    assert_eq!(us.value.values()[1..], [DataValue::Integer(1), DataValue::Float(10.0)]);

    let eu = provider.get(&[text_value("eu")])?.expect("eu row");
    assert_eq!(eu.value.values()[1..], [DataValue::Integer(1), DataValue::Float(5.0)]);
    Ok(())
}

#[test]
fn test_table_aggregate_rejects_functions_without_undo() -> Result<()> {
    let node = node()?;
    node.execute(&create_accounts())?;
    let err = node
        .engine
        .execute(
            &create_as_select(
                DataSourceType::Table,
                "LOWEST",
                region_totals(&[("LOW", AggregateFunction::Min)]),
            ),
            "CREATE TABLE LOWEST AS SELECT REGION, MIN(BALANCE) FROM ACCOUNTS GROUP BY REGION",
            &test_config(),
            &Default::default(),
        )
        .expect_err("MIN cannot undo");
    assert!(matches!(err, EngineError::UserStatement(_)));
    assert!(err.to_string().contains("MIN"));
    assert!(node.engine.metastore().get_source("LOWEST").is_none());
    Ok(())
}

#[test]
fn test_non_aggregate_column_must_be_grouped() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let mut query = item_totals();
    query.select.push(SelectItem::scalar("PRICE", Expression::column("PRICE")));
    let err = node
        .execute(&create_as_select(DataSourceType::Table, "BROKEN", query))
        .expect_err("PRICE is not grouped");
    assert!(err.to_string().contains("not part of GROUP BY"));
    Ok(())
}
