pub mod config;
pub mod processing_log;
pub mod types;
