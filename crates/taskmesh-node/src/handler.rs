//! Gossip message dispatch.
//!
//! The swarm validates signatures, timestamps, and dedup before a message
//! reaches this layer, so handlers only check protocol-level consistency:
//! does the payload parse, does the sender match the actor it names, does
//! the referenced task exist.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use taskmesh_core::message::{
    ClaimPayload, ClaimWithdrawPayload, Envelope, MessageType, ReputationGossipPayload,
    TaskAnnouncePayload, TaskResultPayload,
};
use taskmesh_core::types::TaskHash;
use taskmesh_protocol::task::{TaskEnvelope, TaskKind};
use taskmesh_protocol::verify::{attestation_hash, SubmitError, SubmittedResult};

use crate::state::{default_initial_grant, NodeState};

/// Follow-up actions a handler asks the node loop to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResponse {
    /// Sign and publish a message on its gossip topic.
    Publish { msg_type: MessageType, payload: Value },
    /// Fetch the input payload for a task we have claimed.
    FetchPayload { task_hash: TaskHash },
}

/// Dispatch one validated gossip envelope against node state.
pub fn handle_gossip_message(
    state: &mut NodeState,
    envelope: &Envelope,
    now_ms: i64,
) -> Vec<HandlerResponse> {
    match envelope.msg_type {
        MessageType::PeerAnnounce => handle_peer_announce(state, envelope, now_ms),
        MessageType::TaskAnnounce => handle_task_announce(state, envelope, now_ms),
        MessageType::Claim => handle_claim(state, envelope, now_ms),
        MessageType::ClaimWithdraw => handle_claim_withdraw(state, envelope),
        MessageType::TaskResult => handle_task_result(state, envelope, now_ms),
        MessageType::ReputationGossip => handle_reputation_gossip(state, envelope, now_ms),
        MessageType::ChunkRequest | MessageType::ChunkData => {
            // Chunk transfer rides the stream protocol; a gossiped copy is
            // a misbehaving peer.
            warn!(from = %envelope.from, kind = ?envelope.msg_type,
                  "Chunk message on gossip topic, ignoring");
            Vec::new()
        }
    }
}

fn handle_peer_announce(
    state: &mut NodeState,
    envelope: &Envelope,
    now_ms: i64,
) -> Vec<HandlerResponse> {
    state.grant_initial(&envelope.from, default_initial_grant(), now_ms);
    Vec::new()
}

fn handle_task_announce(
    state: &mut NodeState,
    envelope: &Envelope,
    now_ms: i64,
) -> Vec<HandlerResponse> {
    let Ok(payload) = serde_json::from_value::<TaskAnnouncePayload>(envelope.payload.clone())
    else {
        debug!(from = %envelope.from, "Malformed TASK_ANNOUNCE payload");
        return Vec::new();
    };
    if payload.creator != envelope.from {
        warn!(from = %envelope.from, creator = %payload.creator,
              "TASK_ANNOUNCE creator does not match sender");
        return Vec::new();
    }
    let Ok(kind) = serde_json::from_value::<TaskKind>(json!(payload.kind)) else {
        debug!(kind = %payload.kind, "Unknown task kind");
        return Vec::new();
    };

    let task = TaskEnvelope {
        task_hash: payload.task_hash,
        kind,
        reward: payload.reward,
        deadline_ms: payload.deadline_ms,
        quorum: payload.quorum,
        redundancy: payload.redundancy,
        creator: payload.creator,
        payload_hash: payload.payload_hash,
        payload_size: payload.payload_size as usize,
    };
    if task.quorum == 0 || task.quorum > task.redundancy {
        debug!(task = %task.task_hash, "TASK_ANNOUNCE with invalid quorum, dropped");
        return Vec::new();
    }
    if task.is_expired(now_ms) {
        debug!(task = %task.task_hash, "TASK_ANNOUNCE past deadline, dropped");
        return Vec::new();
    }

    let task_hash = task.task_hash.clone();
    if !state.track_remote_task(task.clone(), now_ms) {
        return Vec::new();
    }
    info!(task = %task_hash, kind = %task.kind.as_str(), reward = %task.reward,
          "Tracking announced task");

    if !state.should_claim(&task, now_ms) {
        return Vec::new();
    }
    let local_id = state.local_id().to_string();
    match state.try_claim(&task_hash, &local_id, now_ms) {
        Ok(_) => {
            info!(task = %task_hash, "Claiming task");
            vec![
                HandlerResponse::Publish {
                    msg_type: MessageType::Claim,
                    payload: json!(ClaimPayload {
                        task_hash: task_hash.clone(),
                        claimant: local_id,
                    }),
                },
                HandlerResponse::FetchPayload { task_hash },
            ]
        }
        Err(err) => {
            debug!(task = %task_hash, %err, "Local claim rejected");
            Vec::new()
        }
    }
}

fn handle_claim(state: &mut NodeState, envelope: &Envelope, now_ms: i64) -> Vec<HandlerResponse> {
    let Ok(payload) = serde_json::from_value::<ClaimPayload>(envelope.payload.clone()) else {
        debug!(from = %envelope.from, "Malformed CLAIM payload");
        return Vec::new();
    };
    if payload.claimant != envelope.from {
        warn!(from = %envelope.from, claimant = %payload.claimant,
              "CLAIM claimant does not match sender");
        return Vec::new();
    }
    match state.try_claim(&payload.task_hash, &payload.claimant, now_ms) {
        Ok(_) => debug!(task = %payload.task_hash, claimant = %payload.claimant, "Claim recorded"),
        Err(err) => debug!(task = %payload.task_hash, %err, "Remote claim rejected"),
    }
    Vec::new()
}

fn handle_claim_withdraw(state: &mut NodeState, envelope: &Envelope) -> Vec<HandlerResponse> {
    let Ok(payload) = serde_json::from_value::<ClaimWithdrawPayload>(envelope.payload.clone())
    else {
        debug!(from = %envelope.from, "Malformed CLAIM_WITHDRAW payload");
        return Vec::new();
    };
    if payload.claimant != envelope.from {
        warn!(from = %envelope.from, claimant = %payload.claimant,
              "CLAIM_WITHDRAW claimant does not match sender");
        return Vec::new();
    }
    if state.withdraw_claim(&payload.task_hash, &payload.claimant) {
        debug!(task = %payload.task_hash, claimant = %payload.claimant, "Claim withdrawn");
    }
    Vec::new()
}

fn handle_task_result(
    state: &mut NodeState,
    envelope: &Envelope,
    now_ms: i64,
) -> Vec<HandlerResponse> {
    let Ok(payload) = serde_json::from_value::<TaskResultPayload>(envelope.payload.clone()) else {
        debug!(from = %envelope.from, "Malformed TASK_RESULT payload");
        return Vec::new();
    };
    if payload.claimant != envelope.from {
        warn!(from = %envelope.from, claimant = %payload.claimant,
              "TASK_RESULT claimant does not match sender");
        return Vec::new();
    }
    let expected =
        attestation_hash(&payload.task_hash, &payload.output_hash, &payload.claimant);
    if payload.attestation != expected {
        warn!(task = %payload.task_hash, claimant = %payload.claimant,
              "TASK_RESULT attestation mismatch");
        return Vec::new();
    }

    let result = SubmittedResult {
        task_hash: payload.task_hash.clone(),
        claimant: payload.claimant,
        output_hash: payload.output_hash,
        attestation: payload.attestation,
        submitted_at_ms: envelope.timestamp,
    };
    match state.record_result(result, now_ms) {
        Ok(Some(record)) => {
            info!(task = %record.task_hash, rewarded = record.rewarded.len(), "Task settled");
        }
        Ok(None) => {}
        Err(SubmitError::UnknownTask(task)) => {
            debug!(%task, "Result for unknown task, dropped");
        }
        Err(err) => {
            debug!(task = %payload.task_hash, %err, "Result rejected");
        }
    }
    Vec::new()
}

fn handle_reputation_gossip(
    state: &mut NodeState,
    envelope: &Envelope,
    now_ms: i64,
) -> Vec<HandlerResponse> {
    let Ok(payload) = serde_json::from_value::<ReputationGossipPayload>(envelope.payload.clone())
    else {
        debug!(from = %envelope.from, "Malformed REPUTATION_GOSSIP payload");
        return Vec::new();
    };
    for assessment in &payload.assessments {
        // Peers do not get to vouch for themselves.
        if assessment.node_id == envelope.from || assessment.node_id == state.local_id() {
            continue;
        }
        state
            .reputation
            .merge_assessment(&assessment.node_id, assessment.score, now_ms);
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::message::ReputationAssessment;
    use taskmesh_core::types::FixedPoint;
    use taskmesh_crypto::identity::NodeIdentity;
    use taskmesh_crypto::signing::sign_message;
    use taskmesh_protocol::task::{TaskPayload, TaskSpec};

    const NOW: i64 = 1_700_000_000_000;

    fn spec() -> TaskSpec {
        TaskSpec {
            payload: TaskPayload::Sum { numbers: vec![1, 2, 3] },
            reward: FixedPoint::from_f64(5.0),
            deadline_ms: NOW + 60_000,
            redundancy: 3,
            quorum: 2,
        }
    }

    fn announce(issuer: &NodeIdentity, task: &TaskEnvelope) -> Envelope {
        sign_message(
            issuer,
            MessageType::TaskAnnounce,
            json!(TaskAnnouncePayload {
                task_hash: task.task_hash.clone(),
                kind: task.kind.as_str().to_string(),
                reward: task.reward,
                deadline_ms: task.deadline_ms,
                quorum: task.quorum,
                redundancy: task.redundancy,
                creator: task.creator.clone(),
                payload_hash: task.payload_hash.clone(),
                payload_size: task.payload_size as u64,
            }),
            NOW,
        )
    }

    fn result_envelope(worker: &NodeIdentity, task_hash: &str, output: &str) -> Envelope {
        let claimant = worker.node_id();
        sign_message(
            worker,
            MessageType::TaskResult,
            json!(TaskResultPayload {
                task_hash: task_hash.to_string(),
                claimant: claimant.clone(),
                output_hash: output.to_string(),
                attestation: attestation_hash(task_hash, output, &claimant),
            }),
            NOW,
        )
    }

    #[test]
    fn task_announce_triggers_claim_and_fetch() {
        let issuer = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("worker");

        let responses = handle_gossip_message(&mut state, &announce(&issuer, &task), NOW);
        assert_eq!(responses.len(), 2);
        assert!(matches!(responses[0], HandlerResponse::Publish { msg_type: MessageType::Claim, .. }));
        assert_eq!(
            responses[1],
            HandlerResponse::FetchPayload { task_hash: task.task_hash.clone() }
        );
        assert!(state.tasks.contains(&task.task_hash));
    }

    #[test]
    fn replayed_announce_is_ignored() {
        let issuer = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("worker");
        let msg = announce(&issuer, &task);

        assert!(!handle_gossip_message(&mut state, &msg, NOW).is_empty());
        assert!(handle_gossip_message(&mut state, &msg, NOW).is_empty());
    }

    #[test]
    fn announce_with_spoofed_creator_dropped() {
        let issuer = NodeIdentity::generate();
        let other = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("worker");

        // Signed by someone other than the creator named in the payload.
        let msg = announce(&other, &task);
        assert!(handle_gossip_message(&mut state, &msg, NOW).is_empty());
        assert!(!state.tasks.contains(&task.task_hash));
    }

    #[test]
    fn announce_with_tampered_hash_dropped() {
        let issuer = NodeIdentity::generate();
        let (mut task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        task.task_hash = "0".repeat(64);
        let mut state = NodeState::new("worker");

        assert!(handle_gossip_message(&mut state, &announce(&issuer, &task), NOW).is_empty());
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn claim_with_mismatched_sender_dropped() {
        let issuer = NodeIdentity::generate();
        let sender = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("observer");
        handle_gossip_message(&mut state, &announce(&issuer, &task), NOW);

        let msg = sign_message(
            &sender,
            MessageType::Claim,
            json!(ClaimPayload {
                task_hash: task.task_hash.clone(),
                claimant: "somebody-else".to_string(),
            }),
            NOW,
        );
        handle_gossip_message(&mut state, &msg, NOW);
        assert!(!state.claims[&task.task_hash].has_claim("somebody-else"));
    }

    #[test]
    fn results_from_two_workers_settle_the_task() {
        let issuer = NodeIdentity::generate();
        let w1 = NodeIdentity::generate();
        let w2 = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("observer");
        handle_gossip_message(&mut state, &announce(&issuer, &task), NOW);

        for worker in [&w1, &w2] {
            let claim = sign_message(
                worker,
                MessageType::Claim,
                json!(ClaimPayload {
                    task_hash: task.task_hash.clone(),
                    claimant: worker.node_id(),
                }),
                NOW,
            );
            handle_gossip_message(&mut state, &claim, NOW);
            let result = result_envelope(worker, &task.task_hash, "same-output");
            handle_gossip_message(&mut state, &result, NOW + 1_000);
        }

        assert!(state.engine.is_settled(&task.task_hash));
        assert_eq!(state.balance(&w1.node_id()), FixedPoint::from_f64(5.0));
        assert_eq!(state.balance(&w2.node_id()), FixedPoint::from_f64(5.0));
    }

    #[test]
    fn result_with_bad_attestation_dropped() {
        let issuer = NodeIdentity::generate();
        let worker = NodeIdentity::generate();
        let (task, _) = TaskEnvelope::from_spec(&spec(), &issuer.node_id()).unwrap();
        let mut state = NodeState::new("observer");
        handle_gossip_message(&mut state, &announce(&issuer, &task), NOW);

        let claimant = worker.node_id();
        let msg = sign_message(
            &worker,
            MessageType::TaskResult,
            json!(TaskResultPayload {
                task_hash: task.task_hash.clone(),
                claimant,
                output_hash: "out".to_string(),
                attestation: "not-the-right-hash".to_string(),
            }),
            NOW,
        );
        handle_gossip_message(&mut state, &msg, NOW);
        assert!(state.engine.record(&task.task_hash).is_none());
    }

    #[test]
    fn reputation_gossip_skips_self_assessments() {
        let gossiper = NodeIdentity::generate();
        let mut state = NodeState::new("me");
        let initial = state.reputation.score_of(&gossiper.node_id());

        let msg = sign_message(
            &gossiper,
            MessageType::ReputationGossip,
            json!(ReputationGossipPayload {
                assessments: vec![
                    ReputationAssessment {
                        node_id: gossiper.node_id(),
                        score: FixedPoint::ONE,
                    },
                    ReputationAssessment {
                        node_id: "honest-peer".to_string(),
                        score: FixedPoint::from_f64(0.8),
                    },
                ],
            }),
            NOW,
        );
        handle_gossip_message(&mut state, &msg, NOW);

        assert_eq!(state.reputation.score_of(&gossiper.node_id()), initial);
        assert_eq!(
            state.reputation.score_of("honest-peer"),
            FixedPoint::from_f64(0.8)
        );
    }

    #[test]
    fn peer_announce_grants_starting_balance_once() {
        let peer = NodeIdentity::generate();
        let mut state = NodeState::new("me");
        let msg = sign_message(
            &peer,
            MessageType::PeerAnnounce,
            json!({
                "addresses": ["/ip4/127.0.0.1/tcp/9000"],
                "capabilities": ["execute"],
                "version": 0,
                "serving": [],
            }),
            NOW,
        );
        handle_gossip_message(&mut state, &msg, NOW);
        handle_gossip_message(&mut state, &msg, NOW + 1_000);
        assert_eq!(state.balance(&peer.node_id()), default_initial_grant());
    }
}
