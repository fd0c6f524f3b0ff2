//! Signed message envelope and wire payload types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{FixedPoint, MessageId, NodeId, TaskHash, Timestamp};

/// All message kinds in the peer wire protocol. DHT announce/lookup traffic
/// rides the Kademlia behaviour directly and has no envelope kind here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Peer discovery
    PeerAnnounce,
    // Task distribution
    TaskAnnounce,
    Claim,
    ClaimWithdraw,
    // Payload transfer (stream protocol, not gossip)
    ChunkRequest,
    ChunkData,
    // Verification
    TaskResult,
    // Reputation
    ReputationGossip,
}

impl MessageType {
    /// Whether this message type uses GossipSub (vs the chunk stream protocol).
    pub fn is_gossipsub(&self) -> bool {
        !matches!(self, MessageType::ChunkRequest | MessageType::ChunkData)
    }

    /// GossipSub topic for this message type (None for stream-only messages).
    pub fn gossipsub_topic(&self) -> Option<&'static str> {
        match self {
            MessageType::PeerAnnounce | MessageType::ReputationGossip => Some("/taskmesh/peers"),
            MessageType::TaskAnnounce => Some("/taskmesh/tasks"),
            MessageType::Claim | MessageType::ClaimWithdraw => Some("/taskmesh/claims"),
            MessageType::TaskResult => Some("/taskmesh/results"),
            MessageType::ChunkRequest | MessageType::ChunkData => None,
        }
    }
}

/// Signed message envelope. Signature verification is mandatory before any
/// payload is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version. MUST be 0.
    pub version: u32,
    /// Message type.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// SHA-256 hex of the signing body. Content address.
    pub id: MessageId,
    /// Hex-encoded Ed25519 public key of sender.
    pub from: NodeId,
    /// Unix time in milliseconds.
    pub timestamp: Timestamp,
    /// Type-specific payload.
    pub payload: Value,
    /// Hex-encoded Ed25519 signature over the signing body.
    pub signature: String,
}

// ─── Typed payload structs ───────────────────────────────────────────

/// PEER_ANNOUNCE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncePayload {
    pub addresses: Vec<String>,
    pub capabilities: Vec<String>,
    pub version: u32,
    /// Task hashes this peer currently serves payload chunks for.
    pub serving: Vec<TaskHash>,
}

/// TASK_ANNOUNCE payload — the task envelope in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAnnouncePayload {
    /// Content hash of the task envelope.
    pub task_hash: TaskHash,
    /// Task kind tag (schema selector for the payload).
    pub kind: String,
    /// Reward for a verified execution.
    pub reward: FixedPoint,
    /// Deadline after which claims and results are rejected.
    pub deadline_ms: Timestamp,
    /// Matching results required to accept an output.
    pub quorum: u32,
    /// Independent claimants allowed concurrently.
    pub redundancy: u32,
    /// Issuer node ID.
    pub creator: NodeId,
    /// SHA-256 hex of the task payload bytes.
    pub payload_hash: String,
    /// Size of the payload in bytes.
    pub payload_size: u64,
}

/// CLAIM payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub task_hash: TaskHash,
    pub claimant: NodeId,
}

/// CLAIM_WITHDRAW payload — a claimant gives its slot back (e.g. sandbox
/// timeout), freeing it for redundancy accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimWithdrawPayload {
    pub task_hash: TaskHash,
    pub claimant: NodeId,
}

/// TASK_RESULT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_hash: TaskHash,
    pub claimant: NodeId,
    /// SHA-256 hex of the canonical output.
    pub output_hash: String,
    /// Execution attestation — hash over task, output, and executor.
    /// Weak evidence of honest execution.
    pub attestation: String,
}

/// REPUTATION_GOSSIP payload — a batch of (peer, score) assessments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationGossipPayload {
    pub assessments: Vec<ReputationAssessment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationAssessment {
    pub node_id: NodeId,
    pub score: FixedPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_topics_route_by_kind() {
        assert_eq!(
            MessageType::TaskAnnounce.gossipsub_topic(),
            Some("/taskmesh/tasks")
        );
        assert_eq!(MessageType::Claim.gossipsub_topic(), Some("/taskmesh/claims"));
        assert_eq!(
            MessageType::TaskResult.gossipsub_topic(),
            Some("/taskmesh/results")
        );
        assert_eq!(
            MessageType::PeerAnnounce.gossipsub_topic(),
            Some("/taskmesh/peers")
        );
    }

    #[test]
    fn chunk_messages_are_stream_only() {
        assert!(!MessageType::ChunkRequest.is_gossipsub());
        assert!(!MessageType::ChunkData.is_gossipsub());
        assert_eq!(MessageType::ChunkData.gossipsub_topic(), None);
    }

    #[test]
    fn task_announce_payload_roundtrip() {
        let payload = TaskAnnouncePayload {
            task_hash: "ab".repeat(32),
            kind: "sort".into(),
            reward: FixedPoint::from_f64(10.0),
            deadline_ms: 1_700_000_000_000,
            quorum: 2,
            redundancy: 3,
            creator: "cd".repeat(32),
            payload_hash: "ef".repeat(32),
            payload_size: 128,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: TaskAnnouncePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
