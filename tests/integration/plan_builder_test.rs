use anyhow::Result;
use bayunstream::catalog::{DataValue, SqlType};
use bayunstream::common::types::DataSourceType;
use bayunstream::engine::statement::{JoinClause, QuerySpec, SelectItem};
use bayunstream::query::expression::{BinaryOperator, Expression};
use bayunstream::query::plan::JoinType;
use bayunstream::runtime::InstanceState;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn expensive_items() -> QuerySpec {
    let mut query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::scalar("PRICE", Expression::column("PRICE")),
        ],
    );
    query.filter = Some(Expression::binary(
        Expression::column("PRICE"),
        BinaryOperator::GreaterThan,
        Expression::literal(DataValue::Float(10.0)),
    ));
    query
}

#[test]
fn test_filter_and_projection_reach_sink() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "EXPENSIVE", expensive_items()))?;
    let query = result.persistent().expect("persistent query").clone();
    assert_eq!(query.state(), InstanceState::Created);
    query.start()?;

    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "2", &order("piano", 900.0), 200);
    node.produce("orders", "3", &order("car", 15000.5), 300);

    let records = node.await_records("EXPENSIVE", 2);
    assert_eq!(records.len(), 2);
    assert_eq!(text(&records[0].key).as_deref(), Some("2"));
    assert_eq!(json(&records[0].value)?, serde_json::json!({"ITEM": "piano", "PRICE": 900.0}));
    assert_eq!(records[1].timestamp, 300);

    let counts = node.engine.metrics().topic("orders");
    assert_eq!(counts.consumed, 3);
    let produced = eventually(TIMEOUT, || {
        let produced = node.engine.metrics().topic("EXPENSIVE").produced;
        (produced == 2).then_some(produced)
    });
    assert_eq!(produced, Some(2));
    Ok(())
}

#[test]
fn test_bad_record_goes_to_processing_log() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "EXPENSIVE", expensive_items()))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    node.produce("orders", "1", "{not json", 100);
    node.produce("orders", "2", &order("piano", 900.0), 200);

    let records = node.await_records("EXPENSIVE", 1);
    assert_eq!(records.len(), 1);
    assert_eq!(query.state(), InstanceState::Running);

    let entries = node.engine.processing_log().get_logger(query.query_id().as_str()).entries();
    assert_eq!(entries.len(), 1);
    Ok(())
}

#[test]
fn test_stream_table_left_join() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    node.execute(&create_source(
        DataSourceType::Table,
        "USERS",
        "users",
        &[("ID", SqlType::BigInt)],
        &[("NAME", SqlType::String)],
    ))?;

    let mut query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ORDERS_ITEM")),
            SelectItem::scalar("NAME", Expression::column("USERS_NAME")),
        ],
    );
    query.join = Some(JoinClause {
        table: "USERS".into(),
        join_type: JoinType::Left,
    });
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ENRICHED", query))?;
    let query = result.persistent().expect("persistent query").clone();
    assert_eq!(query.metadata().sources(), &["ORDERS".to_string(), "USERS".to_string()]);

    node.produce("users", "1", r#"{"NAME":"alice"}"#, 10);
    query.start()?;
    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "7", &order("pear", 3.0), 110);

    let records = node.await_records("ENRICHED", 2);
    assert_eq!(records.len(), 2);
    assert_eq!(json(&records[0].value)?, serde_json::json!({"ITEM": "apple", "NAME": "alice"}));
    assert_eq!(json(&records[1].value)?, serde_json::json!({"ITEM": "pear", "NAME": null}));
    Ok(())
}

#[test]
fn test_plan_summary_names_steps() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "EXPENSIVE", expensive_items()))?;
    let query = result.persistent().expect("persistent query");

    let summary = query.metadata().plan_summary();
    for step in ["StreamSink", "StreamSelect", "StreamFilter", "StreamSource"] {
        assert!(summary.contains(step), "{} missing from {}", step, summary);
    }
    assert!(query.metadata().application_id().ends_with("query_CSAS_EXPENSIVE_0"));
    Ok(())
}
