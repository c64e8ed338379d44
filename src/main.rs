use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bayunstream::common::config::EngineConfig;
use bayunstream::common::processing_log::ProcessingLogContext;
use bayunstream::computation::{
    CommandId, CommandLogFile, CommandRunner, InMemoryCommandLog, StatementExecutor, StatusStore,
};
use bayunstream::engine::{QueryEngine, Statement};
use bayunstream::runtime::{InMemoryBroker, LocalRuntime};

const DEFAULT_APPLICATION_SERVER: &str = "http://localhost:8088";

#[derive(Parser)]
#[command(author, version, about = "BayunStream - continuous SQL over a replicated command log")]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore a command log and print the resulting statuses and queries
    Replay {
        /// Command log, one JSON record per line
        log: PathBuf,
    },

    /// Parse every command in a log without executing it
    Validate {
        /// Command log, one JSON record per line
        log: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if config.application_server.is_none() {
        config.application_server = Some(DEFAULT_APPLICATION_SERVER.to_string());
    }
    Ok(config)
}

fn replay(config: EngineConfig, log: &PathBuf) -> Result<()> {
    let records = CommandLogFile::new(log)
        .read_all()
        .with_context(|| format!("Failed to read command log {}", log.display()))?;

    let runtime = LocalRuntime::new(Arc::new(InMemoryBroker::new()));
    let engine = Arc::new(QueryEngine::new(Arc::new(runtime), ProcessingLogContext::global()));
    let statuses = Arc::new(StatusStore::new());
    let executor = Arc::new(StatementExecutor::new(engine.clone(), statuses.clone()));
    executor.configure(config)?;

    let queue = Arc::new(InMemoryCommandLog::from_records(records));
    let runner = CommandRunner::new(executor, queue);
    runner.process_prior_commands()?;

    println!("Command statuses:");
    for (command_id, status) in statuses.all() {
        println!("  {:<40} {:<10} {}", command_id.to_string(), status.status.to_string(), status.message);
    }

    let queries = engine.persistent_queries();
    println!("Persistent queries: {}", queries.len());
    for query in &queries {
        println!(
            "  {:<30} {:<10} -> {} ({})",
            query.query_id().to_string(),
            query.state().to_string(),
            query.sink_name(),
            query.metadata().sources().join(", ")
        );
    }

    engine.close();
    Ok(())
}

fn validate(log: &PathBuf) -> Result<()> {
    let records = CommandLogFile::new(log)
        .read_all()
        .with_context(|| format!("Failed to read command log {}", log.display()))?;

    let mut invalid = 0;
    for (offset, record) in records.iter().enumerate() {
        let verdict = match Statement::parse(&record.command.statement) {
            Ok(statement) => match CommandId::for_statement(&statement) {
                Ok(expected) if expected == record.command_id => "OK".to_string(),
                Ok(expected) => format!("identity mismatch, statement belongs to {}", expected),
                Err(e) => e.to_string(),
            },
            Err(e) => format!("unparseable statement: {}", e),
        };
        if verdict != "OK" {
            invalid += 1;
        }
        println!("{:>5} {:<40} {}", offset, record.command_id.to_string(), verdict);
    }

    if invalid > 0 {
        bail!("{} of {} commands are invalid", invalid, records.len());
    }
    println!("All {} commands are valid", records.len());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Replay { log } => replay(load_config(cli.config.as_ref())?, log),
        Commands::Validate { log } => validate(log),
    }
}
