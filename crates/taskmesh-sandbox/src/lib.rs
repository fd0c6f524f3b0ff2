//! Sandboxed task execution.
//!
//! Execution is pure: a task's output is a deterministic function of its
//! payload, so honest executors always produce byte-identical canonical
//! output and identical output hashes. The sandbox enforces wall-clock and
//! memory budgets and converts panics into reportable errors.

pub mod executor;
pub mod limits;
pub mod runner;

pub use executor::{ExecutionError, ExecutionReport, Sandbox};
pub use limits::ResourceLimits;
