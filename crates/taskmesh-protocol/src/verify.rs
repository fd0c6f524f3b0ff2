//! Quorum-based result verification and reward settlement.
//!
//! Each peer runs the same deterministic settlement over the results it has
//! seen: group submissions by output hash, accept the first group to reach
//! quorum, and pay every member of the winning group. Ties are broken by
//! earliest quorum timestamp, then by the lexicographically smaller output
//! hash, so peers with the same result set settle identically.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskmesh_core::types::{FixedPoint, NodeId, TaskHash, Timestamp};

use crate::ledger::{EntryReason, Ledger, LedgerEntry};
use crate::task::TaskEnvelope;

/// A signed execution result as considered by settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedResult {
    pub task_hash: TaskHash,
    pub claimant: NodeId,
    pub output_hash: String,
    /// Hash over (task_hash, output_hash, claimant) binding the result to
    /// its executor.
    pub attestation: String,
    pub submitted_at_ms: Timestamp,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Unknown task: {0}")]
    UnknownTask(TaskHash),

    #[error("Duplicate submission from {claimant} for task {task}")]
    DuplicateSubmission { task: TaskHash, claimant: NodeId },

    #[error("No claim on record for {claimant} on task {task}")]
    NotAClaimant { task: TaskHash, claimant: NodeId },

    #[error("Task already settled: {0}")]
    AlreadySettled(TaskHash),
}

/// How escrow is handled when no quorum forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputePolicy {
    /// Return the full escrow to the issuer.
    #[default]
    RefundIssuer,
    /// The escrow is burned; nobody is paid.
    Forfeit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Accepted { output_hash: String },
    Disputed,
}

/// Terminal settlement record for one task. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub task_hash: TaskHash,
    pub outcome: VerificationOutcome,
    pub considered: Vec<SubmittedResult>,
    /// Everyone who claimed the task, whether or not they submitted.
    pub claimants: Vec<NodeId>,
    pub rewarded: Vec<NodeId>,
    pub finalized_at_ms: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultGroup {
    members: Vec<NodeId>,
    /// Timestamp of the submission that brought the group to quorum size.
    reached_quorum_at: Option<Timestamp>,
}

/// Per-task verification state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskVerification {
    envelope: TaskEnvelope,
    results: Vec<SubmittedResult>,
    submitters: HashSet<NodeId>,
    claimants: HashSet<NodeId>,
    groups: HashMap<String, ResultGroup>,
    escrowed: FixedPoint,
    record: Option<VerificationRecord>,
}

impl TaskVerification {
    fn new(envelope: TaskEnvelope, escrowed: FixedPoint) -> Self {
        Self {
            envelope,
            results: Vec::new(),
            submitters: HashSet::new(),
            claimants: HashSet::new(),
            groups: HashMap::new(),
            escrowed,
            record: None,
        }
    }

    fn submit(&mut self, result: SubmittedResult) -> Result<(), SubmitError> {
        if self.record.is_some() {
            return Err(SubmitError::AlreadySettled(self.envelope.task_hash.clone()));
        }
        if !self.claimants.contains(&result.claimant) {
            return Err(SubmitError::NotAClaimant {
                task: self.envelope.task_hash.clone(),
                claimant: result.claimant,
            });
        }
        if !self.submitters.insert(result.claimant.clone()) {
            return Err(SubmitError::DuplicateSubmission {
                task: self.envelope.task_hash.clone(),
                claimant: result.claimant,
            });
        }

        let group = self
            .groups
            .entry(result.output_hash.clone())
            .or_insert_with(|| ResultGroup { members: Vec::new(), reached_quorum_at: None });
        group.members.push(result.claimant.clone());
        if group.reached_quorum_at.is_none()
            && group.members.len() >= self.envelope.quorum as usize
        {
            group.reached_quorum_at = Some(result.submitted_at_ms);
        }

        self.results.push(result);
        Ok(())
    }

    /// The winning output hash, if any group has reached quorum.
    fn winning_group(&self) -> Option<(&str, &ResultGroup)> {
        self.groups
            .iter()
            .filter(|(_, g)| g.reached_quorum_at.is_some())
            .min_by_key(|(hash, g)| (g.reached_quorum_at, hash.as_str().to_owned()))
            .map(|(hash, g)| (hash.as_str(), g))
    }
}

/// Drives verification for every task this node tracks.
///
/// Settlement is the only component that writes to the ledger: escrow at
/// registration, payouts and refunds at finalization, all in one place.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerificationEngine {
    tasks: HashMap<TaskHash, TaskVerification>,
    #[serde(default)]
    dispute_policy: DisputePolicy,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(dispute_policy: DisputePolicy) -> Self {
        Self { tasks: HashMap::new(), dispute_policy }
    }

    /// Start tracking a task, escrowing `reward × redundancy` from the
    /// issuer. Idempotent on the task hash.
    pub fn register_task(
        &mut self,
        ledger: &mut Ledger,
        envelope: &TaskEnvelope,
        now_ms: i64,
    ) -> bool {
        if self.tasks.contains_key(&envelope.task_hash) {
            return false;
        }
        let escrowed =
            FixedPoint::from_raw(envelope.reward.raw().saturating_mul(envelope.redundancy as i64));
        ledger.append(LedgerEntry {
            peer: envelope.creator.clone(),
            delta: FixedPoint::ZERO.saturating_sub(escrowed),
            reason: EntryReason::Escrow,
            task: Some(envelope.task_hash.clone()),
            timestamp_ms: now_ms,
        });
        self.tasks
            .insert(envelope.task_hash.clone(), TaskVerification::new(envelope.clone(), escrowed));
        true
    }

    /// Resume tracking a task after a restart. The escrow entry already
    /// exists in the replayed ledger, so none is appended.
    pub fn resume_task(&mut self, envelope: &TaskEnvelope) -> bool {
        if self.tasks.contains_key(&envelope.task_hash) {
            return false;
        }
        let escrowed =
            FixedPoint::from_raw(envelope.reward.raw().saturating_mul(envelope.redundancy as i64));
        self.tasks
            .insert(envelope.task_hash.clone(), TaskVerification::new(envelope.clone(), escrowed));
        true
    }

    /// Record that a peer has claimed the task. Claimants who never submit
    /// show up as no-shows in the settlement record.
    pub fn register_claimant(&mut self, task_hash: &str, claimant: &str) {
        if let Some(task) = self.tasks.get_mut(task_hash) {
            if task.record.is_none() {
                task.claimants.insert(claimant.to_string());
            }
        }
    }

    /// Accept one result per claimant per task. Only peers holding a
    /// recorded claim may submit; everyone else is turned away before
    /// their output can join a group.
    pub fn submit_result(&mut self, result: SubmittedResult) -> Result<(), SubmitError> {
        let task = self
            .tasks
            .get_mut(&result.task_hash)
            .ok_or_else(|| SubmitError::UnknownTask(result.task_hash.clone()))?;
        debug!(task = %result.task_hash, claimant = %result.claimant, "Result submitted");
        task.submit(result)
    }

    pub fn is_settled(&self, task_hash: &str) -> bool {
        self.tasks
            .get(task_hash)
            .is_some_and(|t| t.record.is_some())
    }

    pub fn record(&self, task_hash: &str) -> Option<&VerificationRecord> {
        self.tasks.get(task_hash).and_then(|t| t.record.as_ref())
    }

    pub fn contains(&self, task_hash: &str) -> bool {
        self.tasks.contains_key(task_hash)
    }

    /// Attempt to settle a task: immediately once a group reaches quorum,
    /// or at deadline with a dispute if none did. Returns the settlement
    /// record when the task transitions to settled; exactly one such record
    /// is ever produced per task.
    pub fn try_finalize(
        &mut self,
        task_hash: &str,
        now_ms: i64,
        ledger: &mut Ledger,
    ) -> Option<VerificationRecord> {
        let task = self.tasks.get_mut(task_hash)?;
        if task.record.is_some() {
            return None;
        }

        let deadline_passed = now_ms > task.envelope.deadline_ms;
        let winner = task
            .winning_group()
            .map(|(hash, group)| (hash.to_string(), group.members.clone()));

        let (outcome, rewarded) = match winner {
            Some((output_hash, members)) => (VerificationOutcome::Accepted { output_hash }, members),
            None if deadline_passed => (VerificationOutcome::Disputed, Vec::new()),
            None => return None,
        };

        let reward = task.envelope.reward;
        let mut paid = FixedPoint::ZERO;
        for peer in &rewarded {
            ledger.append(LedgerEntry {
                peer: peer.clone(),
                delta: reward,
                reason: EntryReason::TaskReward,
                task: Some(task_hash.to_string()),
                timestamp_ms: now_ms,
            });
            paid = paid.saturating_add(reward);
        }

        let refund = match (&outcome, self.dispute_policy) {
            (VerificationOutcome::Accepted { .. }, _) => task.escrowed.saturating_sub(paid),
            (VerificationOutcome::Disputed, DisputePolicy::RefundIssuer) => task.escrowed,
            (VerificationOutcome::Disputed, DisputePolicy::Forfeit) => FixedPoint::ZERO,
        };
        if refund > FixedPoint::ZERO {
            ledger.append(LedgerEntry {
                peer: task.envelope.creator.clone(),
                delta: refund,
                reason: EntryReason::EscrowRefund,
                task: Some(task_hash.to_string()),
                timestamp_ms: now_ms,
            });
        }

        let mut claimants: Vec<NodeId> = task.claimants.iter().cloned().collect();
        claimants.sort();
        let mut rewarded = rewarded;
        rewarded.sort();

        let record = VerificationRecord {
            task_hash: task_hash.to_string(),
            outcome: outcome.clone(),
            considered: task.results.clone(),
            claimants,
            rewarded,
            finalized_at_ms: now_ms,
        };
        task.record = Some(record.clone());

        match &outcome {
            VerificationOutcome::Accepted { output_hash } => {
                info!(task = %task_hash, output = %output_hash,
                      winners = record.rewarded.len(), "Task settled: accepted");
            }
            VerificationOutcome::Disputed => {
                warn!(task = %task_hash, results = record.considered.len(),
                      "Task settled: disputed, no quorum");
            }
        }

        Some(record)
    }

    /// Settle every tracked task whose deadline has passed.
    pub fn finalize_expired(&mut self, now_ms: i64, ledger: &mut Ledger) -> Vec<VerificationRecord> {
        let expired: Vec<TaskHash> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.record.is_none() && now_ms > t.envelope.deadline_ms)
            .map(|(hash, _)| hash.clone())
            .collect();
        expired
            .iter()
            .filter_map(|hash| self.try_finalize(hash, now_ms, ledger))
            .collect()
    }

    /// Drop settled tasks the content store has also forgotten.
    pub fn gc(&mut self, retain: impl Fn(&str) -> bool) {
        self.tasks
            .retain(|hash, t| t.record.is_none() || retain(hash));
    }
}

/// Attestation binding a result to the peer that produced it.
pub fn attestation_hash(task_hash: &str, output_hash: &str, claimant: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(task_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(output_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(claimant.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskPayload, TaskSpec};

    fn envelope(quorum: u32, redundancy: u32) -> TaskEnvelope {
        let spec = TaskSpec {
            payload: TaskPayload::Sum { numbers: vec![1, 2, 3] },
            reward: FixedPoint::from_f64(10.0),
            deadline_ms: 100_000,
            redundancy,
            quorum,
        };
        TaskEnvelope::from_spec(&spec, "issuer").unwrap().0
    }

    fn result(task: &TaskEnvelope, claimant: &str, output: &str, at: i64) -> SubmittedResult {
        SubmittedResult {
            task_hash: task.task_hash.clone(),
            claimant: claimant.to_string(),
            output_hash: output.to_string(),
            attestation: attestation_hash(&task.task_hash, output, claimant),
            submitted_at_ms: at,
        }
    }

    /// Claim first, then submit, the way the protocol orders them.
    fn claim_and_submit(
        engine: &mut VerificationEngine,
        result: SubmittedResult,
    ) -> Result<(), SubmitError> {
        engine.register_claimant(&result.task_hash, &result.claimant);
        engine.submit_result(result)
    }

    #[test]
    fn quorum_reached_settles_accepted() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "out-1", 1_000)).unwrap();
        assert!(engine.try_finalize(&env.task_hash, 1_000, &mut ledger).is_none());

        claim_and_submit(&mut engine, result(&env, "b", "out-1", 2_000)).unwrap();
        let record = engine.try_finalize(&env.task_hash, 2_000, &mut ledger).unwrap();

        assert_eq!(
            record.outcome,
            VerificationOutcome::Accepted { output_hash: "out-1".to_string() }
        );
        assert_eq!(record.rewarded, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ledger.balance("a"), FixedPoint::from_f64(10.0));
        assert_eq!(ledger.balance("b"), FixedPoint::from_f64(10.0));
    }

    #[test]
    fn settlement_is_terminal() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "out-1", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "out-1", 2_000)).unwrap();
        engine.try_finalize(&env.task_hash, 2_000, &mut ledger).unwrap();

        assert!(engine.try_finalize(&env.task_hash, 3_000, &mut ledger).is_none());
        let err = claim_and_submit(&mut engine, result(&env, "c", "out-1", 3_000)).unwrap_err();
        assert!(matches!(err, SubmitError::AlreadySettled(_)));
    }

    #[test]
    fn duplicate_submission_rejected() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "out-1", 1_000)).unwrap();
        let err = claim_and_submit(&mut engine, result(&env, "a", "out-2", 2_000)).unwrap_err();
        assert!(matches!(err, SubmitError::DuplicateSubmission { .. }));
    }

    #[test]
    fn no_quorum_by_deadline_is_disputed_with_refund() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);
        // Escrow debited at registration.
        assert_eq!(ledger.balance("issuer"), FixedPoint::from_f64(-30.0));

        claim_and_submit(&mut engine, result(&env, "a", "out-1", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "out-2", 2_000)).unwrap();

        let record = engine
            .try_finalize(&env.task_hash, env.deadline_ms + 1, &mut ledger)
            .unwrap();
        assert_eq!(record.outcome, VerificationOutcome::Disputed);
        assert!(record.rewarded.is_empty());
        assert_eq!(ledger.balance("issuer"), FixedPoint::ZERO);
    }

    #[test]
    fn forfeit_policy_burns_escrow() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::with_policy(DisputePolicy::Forfeit);
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        let record = engine
            .try_finalize(&env.task_hash, env.deadline_ms + 1, &mut ledger)
            .unwrap();
        assert_eq!(record.outcome, VerificationOutcome::Disputed);
        assert_eq!(ledger.balance("issuer"), FixedPoint::from_f64(-30.0));
    }

    #[test]
    fn tie_break_prefers_earlier_quorum() {
        // Both groups reach quorum before anyone finalizes; the group that
        // got there first wins.
        let env = envelope(2, 4);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "zz-late", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "zz-late", 2_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "c", "aa-early", 3_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "d", "aa-early", 4_000)).unwrap();

        let record = engine.try_finalize(&env.task_hash, 5_000, &mut ledger).unwrap();
        assert_eq!(
            record.outcome,
            VerificationOutcome::Accepted { output_hash: "zz-late".to_string() }
        );
    }

    #[test]
    fn tie_break_same_timestamp_uses_smaller_hash() {
        let env = envelope(2, 4);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "bbb", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "aaa", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "c", "bbb", 2_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "d", "aaa", 2_000)).unwrap();

        let record = engine.try_finalize(&env.task_hash, 5_000, &mut ledger).unwrap();
        assert_eq!(
            record.outcome,
            VerificationOutcome::Accepted { output_hash: "aaa".to_string() }
        );
    }

    #[test]
    fn unspent_escrow_refunded_on_accept() {
        // redundancy 3 escrows 30.0 but only two peers submit and win.
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        claim_and_submit(&mut engine, result(&env, "a", "out", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "out", 2_000)).unwrap();
        engine.try_finalize(&env.task_hash, 2_000, &mut ledger).unwrap();

        assert_eq!(ledger.balance("issuer"), FixedPoint::from_f64(-20.0));
    }

    #[test]
    fn record_lists_no_show_claimants() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);
        for peer in ["a", "b", "ghost"] {
            engine.register_claimant(&env.task_hash, peer);
        }

        claim_and_submit(&mut engine, result(&env, "a", "out", 1_000)).unwrap();
        claim_and_submit(&mut engine, result(&env, "b", "out", 2_000)).unwrap();
        let record = engine.try_finalize(&env.task_hash, 2_000, &mut ledger).unwrap();

        assert!(record.claimants.contains(&"ghost".to_string()));
        assert!(!record.rewarded.contains(&"ghost".to_string()));
    }

    #[test]
    fn finalize_expired_sweeps_overdue_tasks() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        assert!(engine.finalize_expired(env.deadline_ms - 1, &mut ledger).is_empty());
        let records = engine.finalize_expired(env.deadline_ms + 1, &mut ledger);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, VerificationOutcome::Disputed);
    }

    #[test]
    fn result_without_claim_rejected() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        let err = engine.submit_result(result(&env, "a", "out", 1_000)).unwrap_err();
        assert!(matches!(err, SubmitError::NotAClaimant { .. }));

        engine.register_claimant(&env.task_hash, "a");
        engine.submit_result(result(&env, "a", "out", 1_000)).unwrap();
    }

    #[test]
    fn unclaimed_submitters_cannot_win_rewards() {
        // A high-value task nobody claimed: matching results from made-up
        // identities must not form a quorum or draw from escrow.
        let spec = TaskSpec {
            payload: TaskPayload::Sum { numbers: vec![1, 2, 3] },
            reward: FixedPoint::from_f64(100.0),
            deadline_ms: 100_000,
            redundancy: 3,
            quorum: 2,
        };
        let env = TaskEnvelope::from_spec(&spec, "issuer").unwrap().0;
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        engine.register_task(&mut ledger, &env, 0);

        for sybil in ["sybil-1", "sybil-2"] {
            let err = engine.submit_result(result(&env, sybil, "forged", 1_000)).unwrap_err();
            assert!(matches!(err, SubmitError::NotAClaimant { .. }));
        }
        assert!(engine.try_finalize(&env.task_hash, 1_000, &mut ledger).is_none());

        let records = engine.finalize_expired(env.deadline_ms + 1, &mut ledger);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, VerificationOutcome::Disputed);
        assert!(records[0].rewarded.is_empty());
        assert_eq!(ledger.balance("sybil-1"), FixedPoint::ZERO);
        assert_eq!(ledger.balance("issuer"), FixedPoint::ZERO);
    }

    #[test]
    fn register_task_is_idempotent() {
        let env = envelope(2, 3);
        let mut engine = VerificationEngine::new();
        let mut ledger = Ledger::new();
        assert!(engine.register_task(&mut ledger, &env, 0));
        assert!(!engine.register_task(&mut ledger, &env, 0));
        // Escrow charged exactly once.
        assert_eq!(ledger.balance("issuer"), FixedPoint::from_f64(-30.0));
    }
}
