//! Append-only reward ledger.
//!
//! Balances are never stored; they are folded from the entry log on demand,
//! so the log is the single source of truth and replaying it always yields
//! the same balances.

use serde::{Deserialize, Serialize};
use tracing::info;

use taskmesh_core::types::{FixedPoint, NodeId, TaskHash, Timestamp};

/// Why a ledger entry was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Starting balance granted to a new participant.
    InitialGrant,
    /// Issuer funds locked when a task is published.
    Escrow,
    /// Payout to a peer in the winning result group.
    TaskReward,
    /// Unspent escrow returned to the issuer at settlement.
    EscrowRefund,
}

/// One immutable ledger entry. `delta` is signed: escrow debits the issuer,
/// rewards and refunds credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub peer: NodeId,
    pub delta: FixedPoint,
    pub reason: EntryReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskHash>,
    pub timestamp_ms: Timestamp,
}

/// The append-only entry log.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: LedgerEntry) {
        info!(
            peer = %entry.peer,
            delta = %entry.delta,
            reason = ?entry.reason,
            task = entry.task.as_deref().unwrap_or("-"),
            "Ledger entry"
        );
        self.entries.push(entry);
    }

    /// Current balance: the fold of all deltas for a peer.
    pub fn balance(&self, peer: &str) -> FixedPoint {
        self.entries
            .iter()
            .filter(|e| e.peer == peer)
            .fold(FixedPoint::ZERO, |acc, e| acc.saturating_add(e.delta))
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn entries_for<'a>(&'a self, peer: &'a str) -> impl Iterator<Item = &'a LedgerEntry> {
        self.entries.iter().filter(move |e| e.peer == peer)
    }

    pub fn entries_for_task<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a LedgerEntry> {
        self.entries
            .iter()
            .filter(move |e| e.task.as_deref() == Some(task))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(peer: &str, delta: f64, reason: EntryReason, task: Option<&str>) -> LedgerEntry {
        LedgerEntry {
            peer: peer.to_string(),
            delta: FixedPoint::from_f64(delta),
            reason,
            task: task.map(str::to_string),
            timestamp_ms: 1_000,
        }
    }

    #[test]
    fn balance_is_fold_of_deltas() {
        let mut ledger = Ledger::new();
        ledger.append(entry("alice", 100.0, EntryReason::InitialGrant, None));
        ledger.append(entry("alice", -30.0, EntryReason::Escrow, Some("t1")));
        ledger.append(entry("alice", 10.0, EntryReason::EscrowRefund, Some("t1")));
        ledger.append(entry("bob", 10.0, EntryReason::TaskReward, Some("t1")));

        assert_eq!(ledger.balance("alice"), FixedPoint::from_f64(80.0));
        assert_eq!(ledger.balance("bob"), FixedPoint::from_f64(10.0));
        assert_eq!(ledger.balance("carol"), FixedPoint::ZERO);
    }

    #[test]
    fn entries_for_task_filters() {
        let mut ledger = Ledger::new();
        ledger.append(entry("alice", -30.0, EntryReason::Escrow, Some("t1")));
        ledger.append(entry("bob", 10.0, EntryReason::TaskReward, Some("t2")));
        assert_eq!(ledger.entries_for_task("t1").count(), 1);
        assert_eq!(ledger.entries_for_task("t2").count(), 1);
        assert_eq!(ledger.entries_for_task("t3").count(), 0);
    }

    #[test]
    fn replay_reproduces_balances() {
        let mut ledger = Ledger::new();
        ledger.append(entry("alice", 100.0, EntryReason::InitialGrant, None));
        ledger.append(entry("alice", -15.0, EntryReason::Escrow, Some("t1")));

        let wire = serde_json::to_string(&ledger).unwrap();
        let replayed: Ledger = serde_json::from_str(&wire).unwrap();
        assert_eq!(replayed.balance("alice"), ledger.balance("alice"));
        assert_eq!(replayed.len(), ledger.len());
    }
}
