// Command Queue
//
// The replicated command log as seen by one node. Offsets are positions in
// the log, starting at zero.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::Offset;

use super::command::{Command, CommandId, CommandRecord, QueuedCommand};
use super::status::CommandStatusFuture;
use super::{CommandError, Result};

pub trait CommandQueue: Send + Sync {
    /// Append a command, returning a future that completes with its final status
    fn enqueue(&self, command_id: CommandId, command: Command) -> Result<Arc<CommandStatusFuture>>;

    /// Every command in the log so far. Later polls return only newer commands.
    fn restore_commands(&self) -> Result<Vec<QueuedCommand>>;

    /// Commands appended since the last restore or poll, waiting up to `timeout` for one to arrive
    fn poll(&self, timeout: Duration) -> Result<Vec<QueuedCommand>>;
}

#[derive(Default)]
struct LogInner {
    records: Vec<CommandRecord>,
    futures: HashMap<Offset, Arc<CommandStatusFuture>>,
    /// Number of records already handed out
    consumed: usize,
}

impl LogInner {
    fn queued_from(&self, start: usize) -> Vec<QueuedCommand> {
        self.records[start..]
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let offset = (start + i) as Offset;
                QueuedCommand {
                    command_id: record.command_id.clone(),
                    command: record.command.clone(),
                    status: self.futures.get(&offset).cloned(),
                    offset,
                }
            })
            .collect()
    }
}

/// Command log held in memory
#[derive(Default)]
pub struct InMemoryCommandLog {
    inner: Mutex<LogInner>,
    arrived: Condvar,
}

impl InMemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log preloaded with `records`, as read back from a command-log file
    pub fn from_records(records: Vec<CommandRecord>) -> Self {
        InMemoryCommandLog {
            inner: Mutex::new(LogInner {
                records,
                ..LogInner::default()
            }),
            arrived: Condvar::new(),
        }
    }

    pub fn records(&self) -> Vec<CommandRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

impl CommandQueue for InMemoryCommandLog {
    fn enqueue(&self, command_id: CommandId, command: Command) -> Result<Arc<CommandStatusFuture>> {
        let future = Arc::new(CommandStatusFuture::new(command_id.clone()));
        let mut inner = self.inner.lock();
        let offset = inner.records.len() as Offset;
        debug!("Enqueued {} at offset {}", command_id, offset);
        inner.records.push(CommandRecord { command_id, command });
        inner.futures.insert(offset, future.clone());
        self.arrived.notify_all();
        Ok(future)
    }

    fn restore_commands(&self) -> Result<Vec<QueuedCommand>> {
        let mut inner = self.inner.lock();
        let commands = inner.queued_from(0);
        inner.consumed = inner.records.len();
        Ok(commands)
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<QueuedCommand>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.records.len() == inner.consumed {
            if self.arrived.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        let start = inner.consumed;
        let commands = inner.queued_from(start);
        inner.consumed = inner.records.len();
        Ok(commands)
    }
}

/// A command log stored as JSON lines, one `CommandRecord` per line
#[derive(Debug, Clone)]
pub struct CommandLogFile {
    path: PathBuf,
}

impl CommandLogFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CommandLogFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. Blank lines are skipped; line numbers in errors are 1-based.
    pub fn read_all(&self) -> Result<Vec<CommandRecord>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| CommandError::MalformedEntry {
                line: i + 1,
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn append(&self, record: &CommandRecord) -> Result<()> {
        let line = serde_json::to_string(record).map_err(|e| CommandError::MalformedEntry {
            line: 0,
            reason: e.to_string(),
        })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
