use anyhow::Result;
use bayunstream::catalog::DataValue;
use bayunstream::common::types::{DataSourceType, Window};
use bayunstream::engine::statement::{QuerySpec, SelectItem};
use bayunstream::query::aggregate::{AggregateCall, AggregateFunction};
use bayunstream::query::expression::Expression;
use bayunstream::query::materialization::MaterializationError;
use bayunstream::query::plan::WindowExpression;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn totals(window: Option<WindowExpression>) -> QuerySpec {
    let mut query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::aggregate("TOTAL", AggregateCall::new(AggregateFunction::Sum, Some("PRICE"))),
        ],
    );
    query.group_by = vec![Expression::column("ITEM")];
    query.window = window;
    query
}

#[test]
fn test_point_lookup_returns_result_row() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Table, "TOTALS", totals(None)))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    node.produce("orders", "1", &order("apple", 2.0), 100);
    node.produce("orders", "2", &order("apple", 3.5), 200);

    let provider = query.materialization().expect("aggregation is materialized");
    let row = eventually(TIMEOUT, || {
        provider
            .get(&[text_value("apple")])
            .ok()
            .flatten()
            .filter(|row| row.timestamp == 200)
    })
    .expect("apple total");

    assert_eq!(row.key.values(), &[text_value("apple")]);
    assert_eq!(row.key.window(), None);
    assert_eq!(row.value.values(), &[text_value("apple"), DataValue::Float(5.5)]);
    assert_eq!(provider.get(&[text_value("pear")])?, None);
    Ok(())
}

#[test]
fn test_windowed_lookups() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(
        DataSourceType::Table,
        "WINDOWED_TOTALS",
        totals(Some(WindowExpression::Tumbling { size: 100 })),
    ))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    node.produce("orders", "1", &order("apple", 1.0), 10);
    node.produce("orders", "2", &order("apple", 2.0), 150);
    node.produce("orders", "3", &order("apple", 4.0), 199);

    let provider = query.materialization().expect("aggregation is materialized");
    let key = [text_value("apple")];
    let second = eventually(TIMEOUT, || {
        provider
            .get_window(&key, 100)
            .ok()
            .flatten()
            .filter(|row| row.timestamp == 199)
    })
    .expect("second window");
    assert_eq!(second.key.window(), Some(Window::new(100, 200)));
    assert_eq!(second.value.values()[1], DataValue::Float(6.0));

    let rows = provider.range(&key, 0, 100)?;
    let windows: Vec<_> = rows.iter().map(|r| r.key.window()).collect();
    assert_eq!(windows, vec![Some(Window::new(0, 100)), Some(Window::new(100, 200))]);

    assert!(provider.range(&key, 101, 1000)?.is_empty());
    assert_eq!(provider.get_window(&key, 50)?, None);
    Ok(())
}

#[test]
fn test_lookup_kind_must_match_store() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(
        DataSourceType::Table,
        "WINDOWED_TOTALS",
        totals(Some(WindowExpression::Tumbling { size: 100 })),
    ))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    let provider = query.materialization().expect("aggregation is materialized");
    let err = provider.get(&[text_value("apple")]).expect_err("windowed store");
    assert!(matches!(err, MaterializationError::WindowingMismatch { .. }));
    Ok(())
}

#[test]
fn test_closed_query_is_not_available() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(DataSourceType::Table, "TOTALS", totals(None)))?;
    let query = result.persistent().expect("persistent query").clone();

    let provider = query.materialization().expect("aggregation is materialized");
    let err = provider.get(&[text_value("apple")]).expect_err("not started");
    assert!(matches!(err, MaterializationError::NotAvailable { .. }));

    query.start()?;
    assert_eq!(provider.get(&[text_value("apple")])?, None);

    query.close();
    let err = provider.get(&[text_value("apple")]).expect_err("closed");
    assert!(matches!(err, MaterializationError::NotAvailable { .. }));
    Ok(())
}

#[test]
fn test_projection_queries_have_no_materialization() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let query = QuerySpec::new("ORDERS", vec![SelectItem::scalar("ITEM", Expression::column("ITEM"))]);
    let result = node.execute(&create_as_select(DataSourceType::Stream, "ITEMS", query))?;
    assert!(result.persistent().expect("persistent query").materialization().is_none());
    Ok(())
}
