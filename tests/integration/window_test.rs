use anyhow::Result;
use bayunstream::catalog::DataValue;
use bayunstream::common::types::{DataSourceType, Window};
use bayunstream::engine::statement::{QuerySpec, SelectItem};
use bayunstream::query::aggregate::window::{session_window_for, time_windows_for};
use bayunstream::query::aggregate::{AggregateCall, AggregateFunction};
use bayunstream::query::codec::KeyCodec;
use bayunstream::query::expression::Expression;
use bayunstream::query::plan::WindowExpression;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn windowed_counts(window: WindowExpression) -> QuerySpec {
    let mut query = QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::aggregate("N", AggregateCall::new(AggregateFunction::Count, None)),
            SelectItem::aggregate("WSTART", AggregateCall::new(AggregateFunction::WindowStart, None)),
        ],
    );
    query.group_by = vec![Expression::column("ITEM")];
    query.window = Some(window);
    query
}

#[test]
fn test_tumbling_assignment() {
    let tumbling = WindowExpression::Tumbling { size: 10 };
    assert_eq!(time_windows_for(&tumbling, 0), vec![Window::new(0, 10)]);
    assert_eq!(time_windows_for(&tumbling, 9), vec![Window::new(0, 10)]);
    assert_eq!(time_windows_for(&tumbling, 10), vec![Window::new(10, 20)]);
}

#[test]
fn test_hopping_assignment() {
    let hopping = WindowExpression::Hopping { size: 10, advance: 5 };
    assert_eq!(time_windows_for(&hopping, 7), vec![Window::new(0, 10), Window::new(5, 15)]);
    assert_eq!(time_windows_for(&hopping, 10), vec![Window::new(5, 15), Window::new(10, 20)]);
}

#[test]
fn test_session_assignment() {
    let first = session_window_for(&[], 0, 5);
    assert_eq!(first.window, Window::new(0, 0));

    let extended = session_window_for(&[first.window], 4, 5);
    assert_eq!(extended.window, Window::new(0, 4));
    assert_eq!(extended.merged, vec![Window::new(0, 0)]);

    let separate = session_window_for(&[extended.window], 10, 5);
    assert_eq!(separate.window, Window::new(10, 10));
    assert!(separate.merged.is_empty());
}

#[test]
fn test_tumbling_counts_reach_sink_with_windowed_keys() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(
        DataSourceType::Table,
        "COUNTS",
        windowed_counts(WindowExpression::Tumbling { size: 10 }),
    ))?;
    result.persistent().expect("persistent query").start()?;

    node.produce("orders", "1", &order("apple", 1.0), 0);
    node.produce("orders", "2", &order("apple", 1.0), 9);
    node.produce("orders", "3", &order("apple", 1.0), 10);

    let records = node.await_records("COUNTS", 3);
    assert_eq!(records.len(), 3);

    let sink = node.engine.metastore().get_source("COUNTS").expect("sink registered");
    let window = sink.window_info.expect("windowed sink");
    let key_codec = KeyCodec::new(sink.formats.key, &sink.schema, Some(window));

    let windows: Vec<Option<Window>> = records
        .iter()
        .map(|r| key_codec.deserialize(r.key.as_deref()).map(|k| k.window()))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(
        windows,
        vec![Some(Window::new(0, 10)), Some(Window::new(0, 10)), Some(Window::new(10, 20))]
    );
    assert_eq!(json(&records[1].value)?, serde_json::json!({"N": 2, "WSTART": 0}));
    assert_eq!(json(&records[2].value)?, serde_json::json!({"N": 1, "WSTART": 10}));
    Ok(())
}

#[test]
fn test_session_windows_merge_within_gap() -> Result<()> {
    let node = node()?;
    node.execute(&create_orders())?;
    let result = node.execute(&create_as_select(
        DataSourceType::Table,
        "SESSIONS",
        windowed_counts(WindowExpression::Session { gap: 5 }),
    ))?;
    let query = result.persistent().expect("persistent query").clone();
    query.start()?;

    node.produce("orders", "1", &order("apple", 1.0), 0);
    node.produce("orders", "2", &order("apple", 1.0), 4);
    node.produce("orders", "3", &order("apple", 1.0), 10);

    let provider = query.materialization().expect("aggregation is materialized");
    let key = vec![text_value("apple")];
    let rows = eventually(TIMEOUT, || {
        let rows = provider.range(&key, 0, 100).ok()?;
        (rows.len() == 2).then_some(rows)
    })
    .expect("two sessions");

    assert_eq!(rows[0].key.window(), Some(Window::new(0, 4)));
    assert_eq!(rows[1].key.window(), Some(Window::new(10, 10)));
    let counts: Vec<_> = rows.iter().map(|r| r.value.values()[1].clone()).collect();
    assert_eq!(counts, vec![DataValue::Integer(2), DataValue::Integer(1)]);
    Ok(())
}
