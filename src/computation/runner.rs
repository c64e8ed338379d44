// Command Runner
//
// The single apply loop of a node. Commands are applied one at a time in
// offset order; an offset at or below the last applied one is skipped, so a
// redelivered command or a second replay of the log changes nothing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::common::types::Offset;

use super::command::QueuedCommand;
use super::executor::StatementExecutor;
use super::queue::CommandQueue;
use super::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct CommandRunner {
    executor: Arc<StatementExecutor>,
    queue: Arc<dyn CommandQueue>,
    last_applied: Mutex<Option<Offset>>,
    poll_interval: Duration,
}

impl CommandRunner {
    pub fn new(executor: Arc<StatementExecutor>, queue: Arc<dyn CommandQueue>) -> Self {
        CommandRunner {
            executor,
            queue,
            last_applied: Mutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn executor(&self) -> &Arc<StatementExecutor> {
        &self.executor
    }

    pub fn last_applied_offset(&self) -> Option<Offset> {
        *self.last_applied.lock()
    }

    fn already_applied(&self, offset: Offset) -> bool {
        matches!(*self.last_applied.lock(), Some(last) if offset <= last)
    }

    fn apply(&self, command: &QueuedCommand, restoring: bool) -> Result<bool> {
        if self.already_applied(command.offset) {
            debug!("Skipping {} at offset {}: already applied", command.command_id, command.offset);
            return Ok(false);
        }
        if restoring {
            self.executor.handle_restore(command)?;
        } else {
            self.executor.handle_statement(command)?;
        }
        *self.last_applied.lock() = Some(command.offset);
        Ok(true)
    }

    /// Replay the log history, then start every persistent query it compiled
    pub fn process_prior_commands(&self) -> Result<()> {
        let commands = self.queue.restore_commands()?;
        info!("Restoring {} commands", commands.len());
        for command in &commands {
            self.apply(command, true)?;
        }

        let queries = self.executor.engine().persistent_queries();
        info!("Restore complete, starting {} persistent queries", queries.len());
        for query in queries {
            if let Err(e) = query.start() {
                warn!("Failed to start query {} after restore: {}", query.query_id(), e);
            }
        }
        Ok(())
    }

    /// Apply whatever arrived since the last fetch. Returns how many commands were applied.
    pub fn fetch_and_run_commands(&self) -> Result<usize> {
        let commands = self.queue.poll(self.poll_interval)?;
        let mut applied = 0;
        for command in &commands {
            if self.apply(command, false)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Run restore and then the live loop on a dedicated thread
    pub fn start(self: Arc<Self>) -> std::io::Result<RunnerHandle> {
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let thread = thread::Builder::new()
            .name("command-runner".to_string())
            .spawn(move || self.run(shutdown_rx))?;
        Ok(RunnerHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }

    fn run(&self, shutdown: Receiver<()>) {
        if let Err(e) = self.process_prior_commands() {
            error!("Command restore failed: {}", e);
            return;
        }
        loop {
            select! {
                recv(shutdown) -> _ => {
                    info!("Command runner shutting down");
                    break;
                }
                default => {
                    if let Err(e) = self.fetch_and_run_commands() {
                        error!("Command processing stopped: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Stops a runner started with `CommandRunner::start`
pub struct RunnerHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Signal the loop and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Command runner thread panicked");
            }
        }
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
