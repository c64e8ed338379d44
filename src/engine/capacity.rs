// Persistent query capacity

use log::warn;

use crate::common::config::{EngineConfig, MAX_PERSISTENT_QUERIES_CONFIG};

use super::EngineError;

/// Whether starting `new_queries` more would exceed the configured limit
pub fn exceeds_persistent_query_capacity(running: usize, config: &EngineConfig, new_queries: usize) -> bool {
    match config.max_persistent_queries {
        Some(limit) => running + new_queries > limit,
        None => false,
    }
}

pub fn capacity_exceeded(running: usize, config: &EngineConfig, statement_text: &str) -> EngineError {
    let limit = config.max_persistent_queries.unwrap_or(usize::MAX);
    warn!(
        "Rejecting statement: {} running persistent queries, limit {}",
        running, limit
    );
    EngineError::CapacityExceeded(format!(
        "Not executing statement(s) '{}' as it would cause the number of active, persistent queries \
         to exceed the configured limit. Use the TERMINATE command to terminate existing queries, \
         or increase the '{}' setting. Current persistent query count: {}. Configured limit: {}.",
        statement_text, MAX_PERSISTENT_QUERIES_CONFIG, running, limit
    ))
}
