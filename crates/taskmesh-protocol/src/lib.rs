//! Taskmesh protocol logic — task envelopes, claims, verification, rewards.
//!
//! Everything here is pure per-peer state: no networking, no global view.
//! Peers exchange signed messages and converge on a consistent claimant set
//! and settlement outcome without a central coordinator.

pub mod claims;
pub mod ledger;
pub mod reputation;
pub mod task;
pub mod verify;
