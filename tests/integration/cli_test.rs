use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command as Process, Output};

use anyhow::Result;
use bayunstream::common::types::DataSourceType;
use bayunstream::computation::{Command, CommandAction, CommandId, CommandRecord, CommandType};
use bayunstream::engine::statement::{QuerySpec, SelectItem};
use bayunstream::engine::Statement;
use bayunstream::query::expression::Expression;
use tempfile::NamedTempFile;

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn record(command_id: CommandId, statement: &Statement) -> CommandRecord {
    CommandRecord {
        command_id,
        command: Command::new(statement.to_text(), BTreeMap::new(), BTreeMap::new()),
    }
}

fn valid_records() -> Result<Vec<CommandRecord>> {
    let orders = create_orders();
    let items = create_as_select(
        DataSourceType::Stream,
        "ITEMS",
        QuerySpec::new("ORDERS", vec![SelectItem::scalar("ITEM", Expression::column("ITEM"))]),
    );
    Ok(vec![
        record(CommandId::for_statement(&orders)?, &orders),
        record(CommandId::for_statement(&items)?, &items),
    ])
}

fn write_log(records: &[CommandRecord]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    for record in records {
        writeln!(file, "{}", serde_json::to_string(record)?)?;
    }
    file.flush()?;
    Ok(file)
}

fn run(args: &[&str]) -> Result<Output> {
    Ok(Process::new(env!("CARGO_BIN_EXE_bayunstream")).args(args).output()?)
}

#[test]
fn test_replay_prints_statuses_and_queries() -> Result<()> {
    let log = write_log(&valid_records()?)?;
    let output = run(&["replay", log.path().to_str().expect("utf-8 path")])?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Command statuses:"));
    assert!(stdout.contains("stream/ORDERS/create"));
    assert!(stdout.contains("stream/ITEMS/create"));
    assert!(stdout.contains("SUCCESS"));
    assert!(stdout.contains("Persistent queries: 1"));
    assert!(stdout.contains("CSAS_ITEMS_0"));
    Ok(())
}

#[test]
fn test_validate_accepts_consistent_log() -> Result<()> {
    let log = write_log(&valid_records()?)?;
    let output = run(&["validate", log.path().to_str().expect("utf-8 path")])?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("All 2 commands are valid"));
    Ok(())
}

#[test]
fn test_validate_reports_mismatched_identity() -> Result<()> {
    let mut records = valid_records()?;
    records[1].command_id = CommandId::new(CommandType::Table, "ITEMS", CommandAction::Create);
    let log = write_log(&records)?;

    let output = run(&["validate", log.path().to_str().expect("utf-8 path")])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("identity mismatch"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 of 2 commands are invalid"));
    Ok(())
}

#[test]
fn test_replay_rejects_malformed_log() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "not a command")?;
    file.flush()?;

    let output = run(&["replay", file.path().to_str().expect("utf-8 path")])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read command log"));
    Ok(())
}
