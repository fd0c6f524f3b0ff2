//! Node identity and envelope signing for Taskmesh.

pub mod identity;
pub mod signing;
