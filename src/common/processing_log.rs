// Processing Log
//
// Record-level failures inside a running query never stop the query. They
// are written here instead: one named logger per query, each keeping a
// bounded buffer of recent entries and forwarding them to the `log` facade.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::warn;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 1024;

static GLOBAL_CONTEXT: Lazy<Arc<ProcessingLogContext>> = Lazy::new(|| Arc::new(ProcessingLogContext::new()));

/// One record-level failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub logger: String,
    pub message: String,
    /// The offending record, rendered for humans
    pub record: Option<String>,
    pub logged_at: i64,
}

/// Named, bounded processing logger
#[derive(Debug)]
pub struct ProcessingLogger {
    name: String,
    capacity: usize,
    entries: Mutex<VecDeque<ProcessingLogEntry>>,
}

impl ProcessingLogger {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        ProcessingLogger {
            name: name.into(),
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record an error. The oldest entry is evicted when the buffer is full.
    pub fn error(&self, message: impl Into<String>, record: Option<String>) {
        let entry = ProcessingLogEntry {
            logger: self.name.clone(),
            message: message.into(),
            record,
            logged_at: chrono::Utc::now().timestamp_millis(),
        };
        warn!("[{}] {}", entry.logger, entry.message);

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<ProcessingLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Hands out processing loggers by name; the same name yields the same logger
#[derive(Debug)]
pub struct ProcessingLogContext {
    capacity: usize,
    loggers: Mutex<HashMap<String, Arc<ProcessingLogger>>>,
}

impl Default for ProcessingLogContext {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ProcessingLogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide context shared by every engine that does not bring its own
    pub fn global() -> Arc<ProcessingLogContext> {
        GLOBAL_CONTEXT.clone()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ProcessingLogContext {
            capacity,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_logger(&self, name: &str) -> Arc<ProcessingLogger> {
        let mut loggers = self.loggers.lock();
        loggers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProcessingLogger::new(name, self.capacity)))
            .clone()
    }

    /// All entries across every logger, oldest first
    pub fn all_entries(&self) -> Vec<ProcessingLogEntry> {
        let loggers = self.loggers.lock();
        let mut all: Vec<ProcessingLogEntry> = loggers.values().flat_map(|l| l.entries()).collect();
        all.sort_by_key(|e| e.logged_at);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_buffer() {
        let logger = ProcessingLogger::new("q1", 2);
        logger.error("one", None);
        logger.error("two", None);
        logger.error("three", Some("row".to_string()));

        let messages: Vec<String> = logger.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_same_name_same_logger() {
        let ctx = ProcessingLogContext::new();
        ctx.get_logger("q1").error("boom", None);
        assert_eq!(ctx.get_logger("q1").len(), 1);
        assert!(ctx.get_logger("q2").is_empty());
    }
}
