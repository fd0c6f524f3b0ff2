//! Claim tracking — which peers have volunteered to execute which tasks.
//!
//! Claims are best-effort soft state. Every peer keeps its own claim table
//! per task and merges remote claims as they arrive; the table bounds the
//! accepted claimant set at `ceil(redundancy × overcommit)` so settlement
//! never considers more executors than the envelope asked for.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use taskmesh_core::constants::OVERCOMMIT_MARGIN;
use taskmesh_core::types::{FixedPoint, NodeId, TaskHash, Timestamp};

use crate::task::TaskEnvelope;

/// A peer's declaration that it will execute a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub task_hash: TaskHash,
    pub claimant: NodeId,
    pub claimed_at_ms: Timestamp,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClaimError {
    /// The task is unknown, already settled, fully claimed, or the peer
    /// does not meet the task's trust floor.
    #[error("Task unavailable: {0}")]
    TaskUnavailable(TaskHash),

    #[error("Task expired: {0}")]
    TaskExpired(TaskHash),
}

/// Per-task claim state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTable {
    pub task_hash: TaskHash,
    deadline_ms: Timestamp,
    max_claims: usize,
    claims: HashMap<NodeId, Claim>,
    settled: bool,
}

impl ClaimTable {
    pub fn new(envelope: &TaskEnvelope) -> Self {
        Self::with_overcommit(envelope, OVERCOMMIT_MARGIN)
    }

    pub fn with_overcommit(envelope: &TaskEnvelope, overcommit: FixedPoint) -> Self {
        let scaled = FixedPoint::from_raw(envelope.redundancy as i64 * FixedPoint::SCALE)
            .mul(overcommit)
            .raw();
        // Ceiling division by the scale factor.
        let max_claims = ((scaled + FixedPoint::SCALE - 1) / FixedPoint::SCALE).max(1) as usize;
        Self {
            task_hash: envelope.task_hash.clone(),
            deadline_ms: envelope.deadline_ms,
            max_claims,
            claims: HashMap::new(),
            settled: false,
        }
    }

    /// Accept a claim from a peer. Idempotent for a peer that has already
    /// claimed; `eligible` is the caller's reputation gate verdict.
    pub fn claim(
        &mut self,
        claimant: &str,
        now_ms: i64,
        eligible: bool,
    ) -> Result<Claim, ClaimError> {
        if now_ms > self.deadline_ms {
            return Err(ClaimError::TaskExpired(self.task_hash.clone()));
        }
        if self.settled || !eligible {
            return Err(ClaimError::TaskUnavailable(self.task_hash.clone()));
        }
        if let Some(existing) = self.claims.get(claimant) {
            return Ok(existing.clone());
        }
        if self.claims.len() >= self.max_claims {
            return Err(ClaimError::TaskUnavailable(self.task_hash.clone()));
        }

        let claim = Claim {
            task_hash: self.task_hash.clone(),
            claimant: claimant.to_string(),
            claimed_at_ms: now_ms,
        };
        self.claims.insert(claimant.to_string(), claim.clone());
        debug!(task = %self.task_hash, %claimant, total = self.claims.len(), "Claim accepted");
        Ok(claim)
    }

    /// Withdraw a claim, freeing the slot for another peer. Returns whether
    /// a claim was actually removed.
    pub fn withdraw(&mut self, claimant: &str) -> bool {
        self.claims.remove(claimant).is_some()
    }

    /// Merge a claim observed from gossip. Remote claims past the bound are
    /// silently dropped; both peers converge once settlement only counts
    /// results from claimants they agree on.
    pub fn merge_remote(&mut self, claim: Claim) {
        if self.settled || claim.task_hash != self.task_hash {
            return;
        }
        if self.claims.contains_key(&claim.claimant) || self.claims.len() >= self.max_claims {
            return;
        }
        self.claims.insert(claim.claimant.clone(), claim);
    }

    pub fn mark_settled(&mut self) {
        self.settled = true;
    }

    pub fn has_claim(&self, claimant: &str) -> bool {
        self.claims.contains_key(claimant)
    }

    pub fn claimants(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.claims.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    pub fn max_claims(&self) -> usize {
        self.max_claims
    }

    pub fn is_full(&self) -> bool {
        self.claims.len() >= self.max_claims
    }
}
