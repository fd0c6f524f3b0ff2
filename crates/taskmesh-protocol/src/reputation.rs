//! Per-peer reputation derived from verification outcomes.
//!
//! Reputation is advisory: it gates claim acceptance on high-value tasks
//! and informs peer selection, but never blocks message relay. Scores are
//! local observations first, blended with gossiped assessments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use taskmesh_core::constants::{
    DISSENT_PENALTY, ELIGIBILITY_FLOOR, HIGH_VALUE_REWARD, INACTIVITY_DECAY,
    INACTIVITY_THRESHOLD_MS, INITIAL_REPUTATION, NEUTRAL_REPUTATION, NO_SHOW_PENALTY,
    REPUTATION_CAP, REPUTATION_FLOOR, WINNER_INCREMENT,
};
use taskmesh_core::types::{FixedPoint, NodeId, Timestamp};

use crate::verify::{VerificationOutcome, VerificationRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerScore {
    score: FixedPoint,
    last_active_ms: Timestamp,
    /// Set once we have scored this peer from a settlement we witnessed.
    observed_locally: bool,
}

/// Tracks reputation scores for every peer this node has interacted with.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReputationTracker {
    scores: HashMap<NodeId, PeerScore>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score; unknown peers start at the initial value.
    pub fn score_of(&self, peer: &str) -> FixedPoint {
        self.scores
            .get(peer)
            .map(|s| s.score)
            .unwrap_or(INITIAL_REPUTATION)
    }

    /// Whether a peer may claim a task with the given reward. Only
    /// high-value tasks apply the trust floor.
    pub fn is_eligible(&self, peer: &str, reward: FixedPoint) -> bool {
        if reward < HIGH_VALUE_REWARD {
            return true;
        }
        self.score_of(peer) >= ELIGIBILITY_FLOOR
    }

    /// Fold a settlement into peer scores: winners up, dissenters down,
    /// no-show claimants down harder.
    pub fn on_verification_record(&mut self, record: &VerificationRecord) {
        let submitters: Vec<&NodeId> =
            record.considered.iter().map(|r| &r.claimant).collect();

        match &record.outcome {
            VerificationOutcome::Accepted { .. } => {
                for peer in &record.rewarded {
                    self.adjust(peer, WINNER_INCREMENT, record.finalized_at_ms);
                }
                for peer in &submitters {
                    if !record.rewarded.contains(peer) {
                        self.adjust_down(peer, DISSENT_PENALTY, record.finalized_at_ms);
                    }
                }
            }
            // A dispute has no winning group to measure dissent against;
            // only no-shows are penalized.
            VerificationOutcome::Disputed => {}
        }

        for peer in &record.claimants {
            if !submitters.iter().any(|s| *s == peer) {
                self.adjust_down(peer, NO_SHOW_PENALTY, record.finalized_at_ms);
            }
        }
    }

    /// Drift inactive peers toward the neutral score, one step per full
    /// inactivity period.
    pub fn decay_inactive(&mut self, now_ms: i64) {
        for (peer, entry) in self.scores.iter_mut() {
            let idle = now_ms - entry.last_active_ms;
            if idle < INACTIVITY_THRESHOLD_MS {
                continue;
            }
            let periods = (idle / INACTIVITY_THRESHOLD_MS) as i64;
            let step = FixedPoint::from_raw(INACTIVITY_DECAY.raw().saturating_mul(periods));
            let before = entry.score;
            entry.score = if entry.score > NEUTRAL_REPUTATION {
                entry.score.saturating_sub(step).clamp(NEUTRAL_REPUTATION, REPUTATION_CAP)
            } else {
                entry.score.saturating_add(step).clamp(REPUTATION_FLOOR, NEUTRAL_REPUTATION)
            };
            entry.last_active_ms = now_ms;
            if before != entry.score {
                debug!(%peer, from = %before, to = %entry.score, "Reputation decayed");
            }
        }
    }

    /// Blend a gossiped assessment into the local view. Local observations
    /// dominate: an unobserved peer adopts the remote score, an observed
    /// one moves halfway toward it.
    pub fn merge_assessment(&mut self, peer: &str, remote: FixedPoint, now_ms: i64) {
        let remote = remote.clamp(REPUTATION_FLOOR, REPUTATION_CAP);
        match self.scores.get_mut(peer) {
            None => {
                self.scores.insert(
                    peer.to_string(),
                    PeerScore { score: remote, last_active_ms: now_ms, observed_locally: false },
                );
            }
            Some(entry) if !entry.observed_locally => {
                entry.score = remote;
                entry.last_active_ms = now_ms;
            }
            Some(entry) => {
                let mid = FixedPoint::from_raw((entry.score.raw() + remote.raw()) / 2);
                entry.score = mid.clamp(REPUTATION_FLOOR, REPUTATION_CAP);
                entry.last_active_ms = now_ms;
            }
        }
    }

    /// All locally-scored peers, for gossiping assessments.
    pub fn local_assessments(&self) -> Vec<(NodeId, FixedPoint)> {
        let mut out: Vec<(NodeId, FixedPoint)> = self
            .scores
            .iter()
            .filter(|(_, s)| s.observed_locally)
            .map(|(peer, s)| (peer.clone(), s.score))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn tracked_peers(&self) -> usize {
        self.scores.len()
    }

    fn adjust(&mut self, peer: &str, delta: FixedPoint, now_ms: i64) {
        let entry = self.entry(peer, now_ms);
        entry.score = entry
            .score
            .saturating_add(delta)
            .clamp(REPUTATION_FLOOR, REPUTATION_CAP);
        entry.last_active_ms = now_ms;
        entry.observed_locally = true;
    }

    fn adjust_down(&mut self, peer: &str, penalty: FixedPoint, now_ms: i64) {
        let entry = self.entry(peer, now_ms);
        entry.score = entry
            .score
            .saturating_sub(penalty)
            .clamp(REPUTATION_FLOOR, REPUTATION_CAP);
        entry.last_active_ms = now_ms;
        entry.observed_locally = true;
    }

    fn entry(&mut self, peer: &str, now_ms: i64) -> &mut PeerScore {
        self.scores.entry(peer.to_string()).or_insert(PeerScore {
            score: INITIAL_REPUTATION,
            last_active_ms: now_ms,
            observed_locally: false,
        })
    }
}
