// BayunStream Query Module
//
// Everything between a validated logical plan and a running dataflow: the
// execution-plan model, expressions, codecs, timestamp extraction, the
// physical plan builder, aggregation, materialization and sinks.

pub mod aggregate;
pub mod builder;
pub mod codec;
pub mod expression;
pub mod materialization;
pub mod plan;
pub mod sink;
pub mod timestamp;

pub use builder::{Holder, PlanBuilder, PlanError};
pub use plan::ExecutionStep;
