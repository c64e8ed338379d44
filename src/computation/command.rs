// Commands
//
// A command is one statement as written to the command log, keyed by the
// identity of the entity it acts on: `stream/ORDERS/create`,
// `terminate/CSAS_OUT_0/execute` and so on.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::common::types::{DataSourceType, Offset};
use crate::engine::Statement;

use super::status::CommandStatusFuture;
use super::{CommandError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    Stream,
    Table,
    Topic,
    Terminate,
    Cluster,
}

impl From<DataSourceType> for CommandType {
    fn from(source_type: DataSourceType) -> Self {
        match source_type {
            DataSourceType::Stream => CommandType::Stream,
            DataSourceType::Table => CommandType::Table,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandType::Stream => "stream",
            CommandType::Table => "table",
            CommandType::Topic => "topic",
            CommandType::Terminate => "terminate",
            CommandType::Cluster => "cluster",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CommandType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stream" => Ok(CommandType::Stream),
            "table" => Ok(CommandType::Table),
            "topic" => Ok(CommandType::Topic),
            "terminate" => Ok(CommandType::Terminate),
            "cluster" => Ok(CommandType::Cluster),
            _ => Err(CommandError::InvalidCommandId(format!("unknown type '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandAction {
    Create,
    Drop,
    Execute,
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandAction::Create => "create",
            CommandAction::Drop => "drop",
            CommandAction::Execute => "execute",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CommandAction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(CommandAction::Create),
            "drop" => Ok(CommandAction::Drop),
            "execute" => Ok(CommandAction::Execute),
            _ => Err(CommandError::InvalidCommandId(format!("unknown action '{}'", s))),
        }
    }
}

/// Identity of the latest lifecycle action on an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    pub command_type: CommandType,
    pub entity: String,
    pub action: CommandAction,
}

impl CommandId {
    pub fn new(command_type: CommandType, entity: impl Into<String>, action: CommandAction) -> Self {
        CommandId {
            command_type,
            entity: entity.into(),
            action,
        }
    }

    /// Identity a statement is logged under
    pub fn for_statement(statement: &Statement) -> Result<CommandId> {
        let id = match statement {
            Statement::CreateSource(create) => {
                CommandId::new(create.source_type.into(), &create.name, CommandAction::Create)
            }
            Statement::CreateAsSelect(create) => {
                CommandId::new(create.sink_type.into(), &create.name, CommandAction::Create)
            }
            Statement::InsertInto(insert) => CommandId::new(CommandType::Stream, &insert.sink, CommandAction::Execute),
            Statement::DropSource { source_type, name } => {
                CommandId::new((*source_type).into(), name, CommandAction::Drop)
            }
            Statement::TerminateQuery { query_id } => {
                CommandId::new(CommandType::Terminate, query_id.as_str(), CommandAction::Execute)
            }
            Statement::RunScript => CommandId::new(CommandType::Stream, "RunScript", CommandAction::Execute),
            Statement::Query(query) => {
                return Err(CommandError::UnsupportedStatement(format!(
                    "transient query on {}",
                    query.from
                )))
            }
        };
        Ok(id)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.command_type, self.entity, self.action)
    }
}

impl FromStr for CommandId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 || parts[1].is_empty() {
            return Err(CommandError::InvalidCommandId(s.to_string()));
        }
        Ok(CommandId::new(parts[0].parse()?, parts[1], parts[2].parse()?))
    }
}

impl Serialize for CommandId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CommandId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A statement plus the settings it was submitted with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub statement: String,
    /// Session overrides applied when the statement runs
    #[serde(default)]
    pub overwrite_properties: BTreeMap<String, Value>,
    /// Compatibility-breaking settings of the node that wrote the command
    #[serde(default)]
    pub original_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub use_offset_as_query_id: bool,
    /// Written by a node that predates terminate-on-drop
    #[serde(default)]
    pub pre_version_5: bool,
}

impl Command {
    pub fn new(
        statement: impl Into<String>,
        overwrite_properties: BTreeMap<String, Value>,
        original_properties: BTreeMap<String, String>,
    ) -> Self {
        Command {
            statement: statement.into(),
            overwrite_properties,
            original_properties,
            use_offset_as_query_id: false,
            pre_version_5: false,
        }
    }

    pub fn with_offset_as_query_id(mut self, enabled: bool) -> Self {
        self.use_offset_as_query_id = enabled;
        self
    }

    pub fn with_pre_version_5(mut self, legacy: bool) -> Self {
        self.pre_version_5 = legacy;
        self
    }
}

/// One entry of the command log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub command: Command,
}

/// A command read back from the log, at its offset
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command_id: CommandId,
    pub command: Command,
    /// Present when this node submitted the command and someone may be waiting on it
    pub status: Option<Arc<CommandStatusFuture>>,
    pub offset: Offset,
}

impl QueuedCommand {
    pub fn new(command_id: CommandId, command: Command, offset: Offset) -> Self {
        QueuedCommand {
            command_id,
            command,
            status: None,
            offset,
        }
    }
}
