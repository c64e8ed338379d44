// Bayun Stream Engine

pub mod catalog;
pub mod common;
pub mod computation;
pub mod engine;
pub mod query;
pub mod runtime;

// Re-export key items for convenient access
pub use catalog::{DataSource, LogicalSchema, MetaStore};
pub use common::config::EngineConfig;
pub use computation::{CommandRunner, StatementExecutor, StatusStore};
pub use engine::{EngineError, ExecuteResult, QueryEngine, Statement};
pub use query::{ExecutionStep, PlanBuilder};
pub use runtime::{InMemoryBroker, LocalRuntime};
