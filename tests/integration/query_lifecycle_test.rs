use std::time::Duration;

use anyhow::Result;
use bayunstream::catalog::DataValue;
use bayunstream::common::types::{DataSourceType, QueryId};
use bayunstream::engine::statement::{QuerySpec, SelectItem};
use bayunstream::engine::{ExecuteResult, Statement};
use bayunstream::query::expression::{BinaryOperator, Expression};
use bayunstream::runtime::InstanceState;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn items() -> QuerySpec {
    QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::scalar("PRICE", Expression::column("PRICE")),
        ],
    )
}

#[test]
fn test_start_and_close_are_idempotent() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ITEMS", items()))?;
    let query = result.persistent().expect("persistent query").clone();

    query.start()?;
    query.start()?;
    assert_eq!(query.state(), InstanceState::Running);

    query.close();
    query.close();
    assert_eq!(query.state(), InstanceState::NotRunning);
    assert!(query.metadata().is_closed());
    assert!(query.start().is_err());
    Ok(())
}

#[test]
fn test_close_unregisters_query() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ITEMS", items()))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;
    assert_eq!(node.engine.num_persistent_queries(), 1);
    assert_eq!(node.engine.metastore().queries_with_source("ORDERS"), vec![query.query_id().clone()]);

    query.close();
    assert_eq!(node.engine.num_persistent_queries(), 0);
    assert!(node.engine.persistent_query(query.query_id()).is_none());
    assert!(node.engine.metastore().queries_with_source("ORDERS").is_empty());
    Ok(())
}

#[test]
fn test_engine_close_stops_every_query() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    for name in ["FIRST", "SECOND"] {
        let result = node.execute(&create_as_select(DataSourceType::Stream, name, items()))?;
        result.persistent().expect("persistent query").start()?;
    }
    assert_eq!(node.engine.num_persistent_queries(), 2);

    node.engine.close();
    assert_eq!(node.engine.num_persistent_queries(), 0);
    Ok(())
}

#[test]
fn test_terminate_unknown_query_fails() -> Result<()> {
    let node = node()?;
    let err = node
        .engine
        .terminate_query(&QueryId::new("CSAS_NOPE_3"))
        .expect_err("no such query");
    assert_eq!(err.to_string(), "No running query with id CSAS_NOPE_3 was found");
    Ok(())
}

#[test]
fn test_transient_query_delivers_rows_up_to_limit() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let mut query = items();
    query.filter = Some(Expression::binary(
        Expression::column("PRICE"),
        BinaryOperator::GreaterThan,
        Expression::literal(DataValue::Float(1.0)),
    ));
    query.limit = Some(2);

    let transient = match node.execute(&Statement::Query(query))? {
        ExecuteResult::Transient(transient) => transient,
        _ => anyhow::bail!("expected a transient query"),
    };
    assert!(transient.query_id().as_str().starts_with("transient_ORDERS_"));
    assert!(transient
        .metadata()
        .application_id()
        .starts_with("_bayun-default_transient_transient_ORDERS_"));
    assert_eq!(transient.limit(), Some(2));
    assert_eq!(node.engine.num_persistent_queries(), 0);

    transient.start()?;
    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "2", &order("crumb", 0.5), 110);
    node.produce("orders", "3", &order("pear", 3.0), 120);
    node.produce("orders", "4", &order("plum", 4.0), 130);

    let first = transient.next_row(TIMEOUT).expect("first row");
    assert_eq!(first.key.values(), &[DataValue::Integer(1)]);
    let value = first.value.expect("value");
    assert_eq!(value.values(), &[text_value("apple"), DataValue::Float(2.0)]);

    let second = transient.next_row(TIMEOUT).expect("second row");
    assert_eq!(second.timestamp, 120);
    assert_eq!(transient.next_row(Duration::from_millis(200)), None);

    transient.close();
    Ok(())
}

#[test]
fn test_transient_ids_do_not_shift_persistent_ids() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let transient = node.execute(&Statement::Query(items()))?;
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ITEMS", items()))?;
    assert_eq!(
        result.persistent().expect("persistent query").query_id().as_str(),
        "CSAS_ITEMS_0"
    );
    drop(transient);
    Ok(())
}

#[test]
fn test_queries_over_missing_source_fail() -> Result<()> {
    let node = node()?;
    let err = node
        .execute(&Statement::Query(items()))
        .expect_err("ORDERS not created");
    assert!(err.to_string().contains("ORDERS does not exist."));
    Ok(())
}
