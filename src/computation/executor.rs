// Statement Executor
//
// Applies one command from the log to the local engine and records its
// status. User-level failures end as an ERROR status and never stop the
// caller; only an unconfigured executor is reported as an error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::common::config::{EngineConfig, APPLICATION_SERVER_CONFIG, RUN_SCRIPT_STATEMENTS_CONTENT};
use crate::common::types::{DataSourceType, QueryId};
use crate::engine::capacity::{capacity_exceeded, exceeds_persistent_query_capacity};
use crate::engine::{EngineError, ExecuteResult, PersistentQueryMetadata, QueryEngine, Statement};

use super::command::{CommandAction, CommandId, CommandType, QueuedCommand};
use super::status::{CommandStatus, Status, StatusStore};
use super::{CommandError, Result};

/// Whether queries compiled by a command are started right away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Replaying the log; queries are started once the replay is done
    Restore,
    Execute,
}

type StatementResult<T> = std::result::Result<T, EngineError>;

fn user(message: impl Into<String>) -> EngineError {
    EngineError::UserStatement(message.into())
}

/// Queries and sinks created so far by a RUN SCRIPT command
#[derive(Default)]
struct AppliedScript {
    queries: Vec<Arc<PersistentQueryMetadata>>,
    sinks: Vec<String>,
}

pub struct StatementExecutor {
    engine: Arc<QueryEngine>,
    statuses: Arc<StatusStore>,
    config: RwLock<Option<EngineConfig>>,
    /// Command that created each running persistent query
    query_commands: Mutex<HashMap<QueryId, CommandId>>,
}

impl StatementExecutor {
    pub fn new(engine: Arc<QueryEngine>, statuses: Arc<StatusStore>) -> Self {
        StatementExecutor {
            engine,
            statuses,
            config: RwLock::new(None),
            query_commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn configure(&self, config: EngineConfig) -> Result<()> {
        if config.application_server.is_none() {
            return Err(CommandError::InvalidConfig(format!(
                "{} must be set",
                APPLICATION_SERVER_CONFIG
            )));
        }
        *self.config.write() = Some(config);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.config.read().is_some()
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn statuses(&self) -> &Arc<StatusStore> {
        &self.statuses
    }

    pub fn status(&self, command_id: &CommandId) -> Option<CommandStatus> {
        self.statuses.get(command_id)
    }

    /// Apply a newly arrived command, starting any query it creates
    pub fn handle_statement(&self, queued: &QueuedCommand) -> Result<()> {
        self.handle(queued, Mode::Execute)
    }

    /// Apply a command from the log history without starting its queries
    pub fn handle_restore(&self, queued: &QueuedCommand) -> Result<()> {
        self.handle(queued, Mode::Restore)
    }

    fn handle(&self, queued: &QueuedCommand, mode: Mode) -> Result<()> {
        let config = self.config.read().clone().ok_or(CommandError::ProcessorNotConfigured)?;
        debug!("Applying {} at offset {} ({:?})", queued.command_id, queued.offset, mode);

        if self.is_legacy_drop(queued) {
            self.terminate_queries_writing_to(&queued.command_id.entity);
        }

        self.put_status(queued, CommandStatus::new(Status::Parsing, "Parsing statement"));
        let outcome = Statement::parse(&queued.command.statement)
            .map_err(|e| user(format!("Failed to parse statement: {}", e)))
            .and_then(|statement| {
                self.put_status(queued, CommandStatus::new(Status::Executing, "Executing statement"));
                self.execute(&statement, queued, mode, &config)
            });

        match outcome {
            Ok(message) => {
                info!("Command {} succeeded: {}", queued.command_id, message);
                self.put_final_status(queued, CommandStatus::new(Status::Success, message));
            }
            Err(e) => {
                warn!("Command {} failed: {}", queued.command_id, e);
                self.put_final_status(queued, CommandStatus::new(Status::Error, e.to_string()));
            }
        }
        Ok(())
    }

    fn is_legacy_drop(&self, queued: &QueuedCommand) -> bool {
        let id = &queued.command_id;
        queued.command.pre_version_5
            && id.action == CommandAction::Drop
            && matches!(id.command_type, CommandType::Stream | CommandType::Table)
            && self.engine.metastore().get_source(&id.entity).is_some()
    }

    fn put_status(&self, queued: &QueuedCommand, status: CommandStatus) {
        if let Some(future) = &queued.status {
            future.set_status(status.clone());
        }
        self.statuses.put(queued.command_id.clone(), status);
    }

    fn put_final_status(&self, queued: &QueuedCommand, status: CommandStatus) {
        self.statuses.put(queued.command_id.clone(), status.clone());
        if let Some(future) = &queued.status {
            future.set_final_status(status);
        }
    }

    fn execute(
        &self,
        statement: &Statement,
        queued: &QueuedCommand,
        mode: Mode,
        config: &EngineConfig,
    ) -> StatementResult<String> {
        let command = &queued.command;
        match statement {
            Statement::CreateAsSelect(_) | Statement::InsertInto(_) => self.start_query(statement, queued, mode, config),
            Statement::TerminateQuery { query_id } => {
                self.terminate_query(query_id)?;
                Ok("Query terminated.".to_string())
            }
            Statement::RunScript => self.run_script(queued, mode, config),
            Statement::Query(_) => Err(user("Transient queries cannot be run from the command log")),
            Statement::CreateSource(_) | Statement::DropSource { .. } => {
                let merged = config.override_breaking_configs_with_original_values(&command.original_properties);
                let result = self
                    .engine
                    .execute(statement, &command.statement, &merged, &command.overwrite_properties)?;
                Ok(result.message().unwrap_or_default().to_string())
            }
        }
    }

    fn start_query(
        &self,
        statement: &Statement,
        queued: &QueuedCommand,
        mode: Mode,
        config: &EngineConfig,
    ) -> StatementResult<String> {
        let command = &queued.command;
        let merged = config.override_breaking_configs_with_original_values(&command.original_properties);
        let running = self.engine.num_persistent_queries();
        if exceeds_persistent_query_capacity(running, &merged, 1) {
            return Err(capacity_exceeded(running, &merged, &command.statement));
        }
        if command.use_offset_as_query_id {
            self.engine.query_id_generator().activate_new_generator(queued.offset);
        }

        let result = self
            .engine
            .execute(statement, &command.statement, &merged, &command.overwrite_properties)?;
        let query = match result {
            ExecuteResult::Persistent(query) => query,
            _ => return Err(user("Statement did not create a persistent query")),
        };
        self.track(&query, &queued.command_id);
        if mode == Mode::Execute {
            start_or_close(&query)?;
        }

        let query_id = query.query_id();
        Ok(match statement {
            Statement::CreateAsSelect(create) => {
                let kind = match create.sink_type {
                    DataSourceType::Stream => "Stream",
                    DataSourceType::Table => "Table",
                };
                format!(
                    "{} {} created and running. Created by query with query ID: {}",
                    kind, create.name, query_id
                )
            }
            _ => format!("Insert Into query is running with query ID: {}", query_id),
        })
    }

    fn run_script(&self, queued: &QueuedCommand, mode: Mode, config: &EngineConfig) -> StatementResult<String> {
        let command = &queued.command;
        let script = command
            .overwrite_properties
            .get(RUN_SCRIPT_STATEMENTS_CONTENT)
            .and_then(Value::as_str)
            .ok_or_else(|| user("No statements received for LOAD FROM FILE."))?;
        let statements =
            Statement::parse_script(script).map_err(|e| user(format!("Failed to parse script: {}", e)))?;
        if let Some(bad) = statements
            .iter()
            .find(|s| matches!(s, Statement::Query(_) | Statement::RunScript))
        {
            return Err(user(format!(
                "Scripts may not contain transient queries or nested scripts: {}",
                bad.to_text()
            )));
        }

        let merged = config.override_breaking_configs_with_original_values(&command.original_properties);
        let new_queries: usize = statements.iter().map(Statement::persistent_query_count).sum();
        let running = self.engine.num_persistent_queries();
        if exceeds_persistent_query_capacity(running, &merged, new_queries) {
            return Err(capacity_exceeded(running, &merged, script));
        }

        let mut overrides = command.overwrite_properties.clone();
        overrides.remove(RUN_SCRIPT_STATEMENTS_CONTENT);
        let mut applied = AppliedScript::default();
        if let Err(e) = self.apply_script(&statements, queued, mode, &merged, &overrides, &mut applied) {
            self.discard_script(&applied);
            return Err(e);
        }
        Ok(format!(
            "Executed {} statements, started {} persistent queries.",
            statements.len(),
            applied.queries.len()
        ))
    }

    fn apply_script(
        &self,
        statements: &[Statement],
        queued: &QueuedCommand,
        mode: Mode,
        config: &EngineConfig,
        overrides: &BTreeMap<String, Value>,
        applied: &mut AppliedScript,
    ) -> StatementResult<()> {
        for statement in statements {
            if let ExecuteResult::Persistent(query) =
                self.engine.execute(statement, &statement.to_text(), config, overrides)?
            {
                self.track(&query, &queued.command_id);
                if let Statement::CreateAsSelect(create) = statement {
                    applied.sinks.push(create.name.clone());
                }
                applied.queries.push(query);
            }
        }
        if mode == Mode::Execute {
            for query in &applied.queries {
                query.start()?;
            }
        }
        Ok(())
    }

    /// Close the queries of a failed script and drop the sinks they created
    fn discard_script(&self, applied: &AppliedScript) {
        for query in &applied.queries {
            query.close();
            self.query_commands.lock().remove(query.query_id());
        }
        for sink in &applied.sinks {
            if let Err(e) = self.engine.metastore().delete_source(sink) {
                warn!("Failed to drop sink {} of a failed script: {}", sink, e);
            }
        }
    }

    fn track(&self, query: &PersistentQueryMetadata, command_id: &CommandId) {
        self.query_commands
            .lock()
            .insert(query.query_id().clone(), command_id.clone());
    }

    /// Terminate a query and mark the command that created it as TERMINATED
    fn terminate_query(&self, query_id: &QueryId) -> StatementResult<()> {
        self.engine.terminate_query(query_id)?;
        let creator = self.query_commands.lock().remove(query_id);
        if let Some(creator) = creator {
            if self.statuses.get(&creator).map(|s| s.status) == Some(Status::Success) {
                self.statuses
                    .put(creator, CommandStatus::new(Status::Terminated, "Query terminated."));
            }
        }
        Ok(())
    }

    fn terminate_queries_writing_to(&self, sink: &str) {
        for query_id in self.engine.metastore().queries_with_sink(sink) {
            info!("Terminating query {} before legacy drop of {}", query_id, sink);
            if let Err(e) = self.terminate_query(&query_id) {
                warn!("Failed to terminate query {}: {}", query_id, e);
            }
        }
    }
}

fn start_or_close(query: &PersistentQueryMetadata) -> StatementResult<()> {
    if let Err(e) = query.start() {
        query.close();
        return Err(e.into());
    }
    Ok(())
}
