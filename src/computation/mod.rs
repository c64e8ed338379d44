//! Distributed Command Processor
//!
//! Every node applies the same replicated log of commands, in offset order,
//! to its own query engine. A command moves through
//! QUEUED -> PARSING -> EXECUTING -> SUCCESS | ERROR, and a command whose
//! query is later terminated ends up TERMINATED.
//!
//! On startup the log is replayed in restore mode: queries are compiled but
//! only started once the replay has caught up with the live tail.

pub mod command;
pub mod executor;
pub mod queue;
pub mod runner;
pub mod status;

use thiserror::Error;

pub use self::command::{Command, CommandAction, CommandId, CommandRecord, CommandType, QueuedCommand};
pub use self::executor::{Mode, StatementExecutor};
pub use self::queue::{CommandLogFile, CommandQueue, InMemoryCommandLog};
pub use self::runner::{CommandRunner, RunnerHandle};
pub use self::status::{CommandStatus, CommandStatusFuture, Status, StatusStore};

/// Failures that stop command processing. Statement-level failures never
/// show up here; they end as an ERROR status instead.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Cannot process commands before the statement executor is configured")]
    ProcessorNotConfigured,
    #[error("Invalid executor configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid command id: {0}")]
    InvalidCommandId(String),
    #[error("Statement cannot be distributed: {0}")]
    UnsupportedStatement(String),
    #[error("Command log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed command log entry at line {line}: {reason}")]
    MalformedEntry { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, CommandError>;
