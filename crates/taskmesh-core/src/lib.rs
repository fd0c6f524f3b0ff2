//! Core types for the Taskmesh task-distribution protocol.

pub mod canonical;
pub mod message;
pub mod types;

pub use types::constants;
