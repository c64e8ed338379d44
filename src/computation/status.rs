// Command Status
//
// The status store maps each command identity to its latest status. It is
// written only by the apply loop and may be read from anywhere.
// A CommandStatusFuture lets the node that submitted a command block until
// that command reaches a final status.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::command::CommandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Parsing,
    Executing,
    Success,
    Error,
    Terminated,
}

impl Status {
    pub fn is_final(&self) -> bool {
        matches!(self, Status::Success | Status::Error | Status::Terminated)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Parsing => "PARSING",
            Status::Executing => "EXECUTING",
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub status: Status,
    pub message: String,
}

impl CommandStatus {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        CommandStatus {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: RwLock<HashMap<CommandId, CommandStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, command_id: CommandId, status: CommandStatus) {
        self.statuses.write().insert(command_id, status);
    }

    pub fn get(&self, command_id: &CommandId) -> Option<CommandStatus> {
        self.statuses.read().get(command_id).cloned()
    }

    pub fn all(&self) -> BTreeMap<CommandId, CommandStatus> {
        self.statuses
            .read()
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }
}

#[derive(Debug)]
pub struct CommandStatusFuture {
    command_id: CommandId,
    current: Mutex<CommandStatus>,
    completed: Condvar,
}

impl CommandStatusFuture {
    pub fn new(command_id: CommandId) -> Self {
        CommandStatusFuture {
            command_id,
            current: Mutex::new(CommandStatus::new(Status::Queued, "Statement written to command topic")),
            completed: Condvar::new(),
        }
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn set_status(&self, status: CommandStatus) {
        *self.current.lock() = status;
    }

    pub fn set_final_status(&self, status: CommandStatus) {
        let mut current = self.current.lock();
        *current = status;
        self.completed.notify_all();
    }

    pub fn current(&self) -> CommandStatus {
        self.current.lock().clone()
    }

    /// Wait until the command reaches a final status. `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<CommandStatus> {
        let deadline = Instant::now() + timeout;
        let mut current = self.current.lock();
        while !current.status.is_final() {
            if self.completed.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
        if current.status.is_final() {
            Some(current.clone())
        } else {
            None
        }
    }
}
