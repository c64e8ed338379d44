use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bayunstream::catalog::DataValue;
use bayunstream::common::config::{EngineConfig, RUN_SCRIPT_STATEMENTS_CONTENT};
use bayunstream::common::types::{DataSourceType, QueryId};
use bayunstream::computation::{
    Command, CommandId, CommandQueue, CommandRecord, CommandRunner, InMemoryCommandLog, QueuedCommand, Status,
};
use bayunstream::engine::statement::{InsertInto, QuerySpec, SelectItem};
use bayunstream::engine::Statement;
use bayunstream::query::expression::{BinaryOperator, Expression};
use bayunstream::runtime::InstanceState;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn items_query() -> QuerySpec {
    QuerySpec::new(
        "ORDERS",
        vec![
            SelectItem::scalar("ITEM", Expression::column("ITEM")),
            SelectItem::scalar("PRICE", Expression::column("PRICE")),
        ],
    )
}

fn expensive_query() -> QuerySpec {
    let mut query = items_query();
    query.filter = Some(Expression::binary(
        Expression::column("PRICE"),
        BinaryOperator::GreaterThan,
        Expression::literal(DataValue::Float(10.0)),
    ));
    query
}

fn create_items(name: &str) -> Statement {
    create_as_select(DataSourceType::Stream, name, items_query())
}

fn record(statement: &Statement) -> Result<CommandRecord> {
    Ok(CommandRecord {
        command_id: CommandId::for_statement(statement)?,
        command: Command::new(statement.to_text(), BTreeMap::new(), BTreeMap::new()),
    })
}

fn status_of(node: &TestNode, statement: &Statement) -> Result<Status> {
    let id = CommandId::for_statement(statement)?;
    Ok(node.statuses.get(&id).expect("status recorded").status)
}

#[test]
fn test_create_as_select_runs_and_reports_success() -> Result<()> {
    let node = node()?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    let command = queued(&create_items("ITEMS"), 1)?;
    node.executor.handle_statement(&command)?;

    let status = node.executor.status(&command.command_id).expect("status recorded");
    assert_eq!(status.status, Status::Success);
    assert_eq!(
        status.message,
        "Stream ITEMS created and running. Created by query with query ID: CSAS_ITEMS_0"
    );
    let query = node
        .engine
        .persistent_query(&QueryId::new("CSAS_ITEMS_0"))
        .expect("query registered");
    assert_eq!(query.state(), InstanceState::Running);
    Ok(())
}

#[test]
fn test_status_future_follows_command() -> Result<()> {
    let node = node()?;
    let log = InMemoryCommandLog::new();
    let statement = create_orders();
    let future = log.enqueue(
        CommandId::for_statement(&statement)?,
        Command::new(statement.to_text(), BTreeMap::new(), BTreeMap::new()),
    )?;
    assert_eq!(future.current().status, Status::Queued);

    for command in log.restore_commands()? {
        node.executor.handle_statement(&command)?;
    }
    let status = future.wait(TIMEOUT).expect("final status");
    assert_eq!(status.status, Status::Success);
    assert_eq!(status.message, "Stream created");
    Ok(())
}

#[test]
fn test_capacity_limit_rejects_without_side_effects() -> Result<()> {
    let node = node_with_config(EngineConfig {
        max_persistent_queries: Some(1),
        ..test_config()
    })?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    node.executor.handle_statement(&queued(&create_items("FIRST"), 1)?)?;
    let second = queued(&create_items("SECOND"), 2)?;
    node.executor.handle_statement(&second)?;

    let status = node.executor.status(&second.command_id).expect("status recorded");
    assert_eq!(status.status, Status::Error);
    assert!(status.message.contains("exceed the configured limit"));
    assert!(node.engine.metastore().get_source("SECOND").is_none());
    assert_eq!(node.engine.num_persistent_queries(), 1);
    Ok(())
}

#[test]
fn test_drop_of_source_in_use_fails() -> Result<()> {
    let node = node()?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    node.executor.handle_statement(&queued(&create_items("ITEMS"), 1)?)?;

    let drop = Statement::DropSource {
        source_type: DataSourceType::Stream,
        name: "ITEMS".to_string(),
    };
    node.executor.handle_statement(&queued(&drop, 2)?)?;
    assert_eq!(status_of(&node, &drop)?, Status::Error);
    assert!(node.engine.metastore().get_source("ITEMS").is_some());
    Ok(())
}

#[test]
fn test_legacy_drop_terminates_writers_first() -> Result<()> {
    let node = node()?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    node.executor.handle_statement(&queued(&create_items("ITEMS"), 1)?)?;
    let insert = Statement::InsertInto(InsertInto {
        sink: "ITEMS".to_string(),
        query: expensive_query(),
    });
    node.executor.handle_statement(&queued(&insert, 2)?)?;
    assert_eq!(node.engine.num_persistent_queries(), 2);

    let drop = Statement::DropSource {
        source_type: DataSourceType::Stream,
        name: "ITEMS".to_string(),
    };
    let mut command = queued(&drop, 3)?;
    command.command = command.command.with_pre_version_5(true);
    node.executor.handle_statement(&command)?;

    assert_eq!(status_of(&node, &drop)?, Status::Success);
    assert_eq!(node.engine.num_persistent_queries(), 0);
    assert!(node.engine.metastore().get_source("ITEMS").is_none());
    assert_eq!(status_of(&node, &create_items("ITEMS"))?, Status::Terminated);
    Ok(())
}

#[test]
fn test_drop_of_absent_source_succeeds() -> Result<()> {
    let node = node()?;
    let drop = Statement::DropSource {
        source_type: DataSourceType::Table,
        name: "MISSING".to_string(),
    };
    node.executor.handle_statement(&queued(&drop, 0)?)?;
    let status = node.statuses.get(&CommandId::for_statement(&drop)?).expect("status recorded");
    assert_eq!(status.status, Status::Success);
    assert_eq!(status.message, "Source MISSING does not exist.");
    Ok(())
}

#[test]
fn test_offset_seeded_query_ids() -> Result<()> {
    let node = node()?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    let mut command = queued(&create_items("ITEMS"), 7)?;
    command.command = command.command.with_offset_as_query_id(true);
    node.executor.handle_statement(&command)?;

    assert!(node.engine.persistent_query(&QueryId::new("CSAS_ITEMS_7")).is_some());
    assert!(node.engine.query_id_generator().is_offset_seeded());
    Ok(())
}

#[test]
fn test_terminate_marks_creator_terminated() -> Result<()> {
    let node = node()?;
    node.executor.handle_statement(&queued(&create_orders(), 0)?)?;
    node.executor.handle_statement(&queued(&create_items("ITEMS"), 1)?)?;

    let terminate = Statement::TerminateQuery {
        query_id: QueryId::new("CSAS_ITEMS_0"),
    };
    node.executor.handle_statement(&queued(&terminate, 2)?)?;

    let status = node.statuses.get(&CommandId::for_statement(&terminate)?).expect("status recorded");
    assert_eq!(status.status, Status::Success);
    assert_eq!(status.message, "Query terminated.");
    assert_eq!(status_of(&node, &create_items("ITEMS"))?, Status::Terminated);
    assert!(node.engine.persistent_query(&QueryId::new("CSAS_ITEMS_0")).is_none());
    Ok(())
}

fn run_script(statements: &[Statement], offset: u64) -> Result<QueuedCommand> {
    let script = serde_json::to_string(statements)?;
    let mut overrides = BTreeMap::new();
    overrides.insert(RUN_SCRIPT_STATEMENTS_CONTENT.to_string(), serde_json::Value::String(script));
    let statement = Statement::RunScript;
    Ok(QueuedCommand::new(
        CommandId::for_statement(&statement)?,
        Command::new(statement.to_text(), overrides, BTreeMap::new()),
        offset,
    ))
}

#[test]
fn test_run_script_executes_every_statement() -> Result<()> {
    let node = node()?;
    let command = run_script(&[create_orders(), create_items("ITEMS")], 0)?;
    node.executor.handle_statement(&command)?;

    let status = node.executor.status(&command.command_id).expect("status recorded");
    assert_eq!(status.status, Status::Success);
    assert_eq!(status.message, "Executed 2 statements, started 1 persistent queries.");
    assert_eq!(node.engine.num_persistent_queries(), 1);
    Ok(())
}

#[test]
fn test_failed_run_script_leaves_no_queries_behind() -> Result<()> {
    let node = node()?;
    let command = run_script(&[create_orders(), create_items("ITEMS"), create_items("ITEMS")], 0)?;
    node.executor.handle_statement(&command)?;

    let status = node.executor.status(&command.command_id).expect("status recorded");
    assert_eq!(status.status, Status::Error);
    assert!(status.message.contains("already exists"), "{}", status.message);
    assert_eq!(node.engine.num_persistent_queries(), 0);
    assert!(node.engine.persistent_query(&QueryId::new("CSAS_ITEMS_0")).is_none());
    assert!(node.engine.metastore().get_source("ITEMS").is_none());
    assert!(node.engine.metastore().queries_with_source("ORDERS").is_empty());

    // the script left ORDERS, and ITEMS can be created again
    node.executor.handle_statement(&queued(&create_items("ITEMS"), 1)?)?;
    assert_eq!(status_of(&node, &create_items("ITEMS"))?, Status::Success);
    assert_eq!(node.engine.num_persistent_queries(), 1);
    Ok(())
}

#[test]
fn test_run_script_without_content_fails() -> Result<()> {
    let node = node()?;
    let command = queued(&Statement::RunScript, 0)?;
    node.executor.handle_statement(&command)?;

    let status = node.executor.status(&command.command_id).expect("status recorded");
    assert_eq!(status.status, Status::Error);
    assert_eq!(status.message, "No statements received for LOAD FROM FILE.");
    Ok(())
}

#[test]
fn test_restore_is_idempotent_and_starts_queries() -> Result<()> {
    let node = node()?;
    let log = Arc::new(InMemoryCommandLog::from_records(vec![
        record(&create_orders())?,
        record(&create_items("ITEMS"))?,
    ]));
    let runner = CommandRunner::new(node.executor.clone(), log);

    runner.process_prior_commands()?;
    runner.process_prior_commands()?;

    assert_eq!(runner.last_applied_offset(), Some(1));
    assert_eq!(status_of(&node, &create_orders())?, Status::Success);
    assert_eq!(status_of(&node, &create_items("ITEMS"))?, Status::Success);
    let query = node
        .engine
        .persistent_query(&QueryId::new("CSAS_ITEMS_0"))
        .expect("query restored");
    assert_eq!(query.state(), InstanceState::Running);
    Ok(())
}

#[test]
fn test_restored_queries_start_once_replay_completes() -> Result<()> {
    let node = node()?;
    node.executor.handle_restore(&queued(&create_orders(), 0)?)?;
    node.executor.handle_restore(&queued(&create_items("ITEMS"), 1)?)?;

    assert_eq!(status_of(&node, &create_items("ITEMS"))?, Status::Success);
    let query = node
        .engine
        .persistent_query(&QueryId::new("CSAS_ITEMS_0"))
        .expect("query compiled");
    assert_eq!(query.state(), InstanceState::Created);

    let runner = CommandRunner::new(node.executor.clone(), Arc::new(InMemoryCommandLog::from_records(Vec::new())));
    runner.process_prior_commands()?;
    assert_eq!(query.state(), InstanceState::Running);
    Ok(())
}

#[test]
fn test_runner_thread_applies_new_commands() -> Result<()> {
    let node = node()?;
    let log = Arc::new(InMemoryCommandLog::from_records(vec![record(&create_orders())?]));
    let runner = Arc::new(
        CommandRunner::new(node.executor.clone(), log.clone()).with_poll_interval(Duration::from_millis(20)),
    );
    let handle = runner.clone().start()?;

    let statement = create_items("ITEMS");
    let future = log.enqueue(
        CommandId::for_statement(&statement)?,
        Command::new(statement.to_text(), BTreeMap::new(), BTreeMap::new()),
    )?;
    let status = future.wait(TIMEOUT).expect("command applied");
    assert_eq!(status.status, Status::Success);
    assert_eq!(runner.last_applied_offset(), Some(1));

    handle.stop();
    Ok(())
}
