use anyhow::Result;
use bayunstream::catalog::SqlType;
use bayunstream::common::types::DataSourceType;
use bayunstream::engine::statement::{CreateAsSelect, QuerySpec, SelectItem};
use bayunstream::engine::Statement;
use bayunstream::query::expression::Expression;
use bayunstream::query::plan::{Format, Formats};

#[path = "../common/mod.rs"]
mod common;

use common::*;

#[test]
fn test_key_copies_are_not_written_to_value() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ID", Expression::column("ID")),
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
        ],
    );
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ITEMS", query))?;
    result.persistent().expect("persistent query").start()?;

    node.produce("orders", "42", &order("apple", 1.0), 100);

    let records = node.await_records("ITEMS", 1);
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0].key).as_deref(), Some("42"));
    assert_eq!(json(&records[0].value)?, serde_json::json!({"ITEM": "apple"}));

    let sink = node.engine.metastore().get_source("ITEMS").expect("sink registered");
    assert!(sink.is_query_sink);
    let names: Vec<&str> = sink.schema.value().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["ITEM"]);
    Ok(())
}

#[test]
fn test_table_tombstone_reaches_sink() -> Result<()> {
    let node = node()?;
    node.execute(&create_source(
        DataSourceType::Table,
        "USERS",
        "users",
        &[("ID", SqlType::BigInt)],
        &[("NAME", SqlType::String)],
    ))?;
    let query = QuerySpec::new("USERS", vec![SelectItem::scalar("NAME", Expression::column("NAME"))]);
    let result = node.execute(&create_as_select(DataSourceType::Table, "USER_NAMES", query))?;
    result.persistent().expect("persistent query").start()?;

    node.produce("users", "1", r#"{"NAME":"alice"}"#, 10);
    node.produce_tombstone("users", "1", 20);

    let records = node.await_records("USER_NAMES", 2);
    assert_eq!(records.len(), 2);
    assert_eq!(json(&records[0].value)?, serde_json::json!({"NAME": "alice"}));
    assert_eq!(text(&records[1].key).as_deref(), Some("1"));
    assert_eq!(records[1].value, None);
    assert_eq!(records[1].timestamp, 20);
    Ok(())
}

#[test]
fn test_sink_topic_and_formats_override() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let statement = Statement::CreateAsSelect(CreateAsSelect {
        sink_type: DataSourceType::Stream,
        name: "ITEM_NAMES".to_string(),
        topic: Some("item_names_delimited".to_string()),
        formats: Some(Formats::new(Format::Json, Format::Delimited)),
        query: QuerySpec::new("ORDERS", vec![SelectItem::scalar("ITEM", Expression::column("ITEM"))]),
    });
    let result = node.execute(&statement)?;
    result.persistent().expect("persistent query").start()?;

    node.produce("orders", "1", &order("pear, green", 1.0), 100);

    let records = node.await_records("item_names_delimited", 1);
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0].value).as_deref(), Some(r#""pear, green""#));
    assert!(node.broker.records("ITEM_NAMES").is_empty());

    let sink = node.engine.metastore().get_source("ITEM_NAMES").expect("sink registered");
    assert_eq!(sink.topic, "item_names_delimited");
    assert_eq!(sink.formats.value, Format::Delimited);
    Ok(())
}
