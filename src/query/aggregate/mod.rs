//! Aggregation & Windowing
//!
//! Aggregate functions, the parameters that fold rows into aggregate
//! records, window assignment for tumbling, hopping and session windows,
//! and the lowering of aggregate steps onto the runtime.

pub mod builder;
pub mod function;
pub mod params;
pub mod window;
pub mod window_select;

pub use self::function::{AggregateCall, AggregateFunction};
pub use self::params::{aggregate_column_name, AggregateParams};
pub use self::window::{session_window_for, time_windows_for, SessionAssignment};
pub use self::window_select::WindowSelectMapper;
