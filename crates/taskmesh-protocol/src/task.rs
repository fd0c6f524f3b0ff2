//! Task envelopes and the content-addressed task store.
//!
//! A task is identified by the content address of its envelope, so the same
//! submission always produces the same task hash and re-announcements are
//! idempotent. The input payload travels separately (inline for small tasks,
//! chunked otherwise) and is bound to the envelope by `payload_hash`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use taskmesh_core::canonical::{sha256_hex, value_address};
use taskmesh_core::constants::{
    DEFAULT_QUORUM, DEFAULT_REDUNDANCY, HIGH_VALUE_REWARD, SETTLEMENT_RETENTION_MS,
};
use taskmesh_core::types::{FixedPoint, NodeId, TaskHash, Timestamp};

/// The catalog of computations a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Sum,
    Multiply,
    Sort,
    Hash,
    Factorial,
    PrimeCheck,
    MatrixMultiply,
    TextAnalysis,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sum => "sum",
            TaskKind::Multiply => "multiply",
            TaskKind::Sort => "sort",
            TaskKind::Hash => "hash",
            TaskKind::Factorial => "factorial",
            TaskKind::PrimeCheck => "prime_check",
            TaskKind::MatrixMultiply => "matrix_multiply",
            TaskKind::TextAnalysis => "text_analysis",
        }
    }
}

/// Input payload for a task, tagged by kind so a payload fetched over the
/// wire can be checked against the envelope it claims to belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "input", rename_all = "snake_case")]
pub enum TaskPayload {
    Sum { numbers: Vec<i64> },
    Multiply { numbers: Vec<i64> },
    Sort { numbers: Vec<i64> },
    Hash { text: String },
    Factorial { n: u64 },
    PrimeCheck { n: u64 },
    MatrixMultiply { a: Vec<Vec<i64>>, b: Vec<Vec<i64>> },
    TextAnalysis { text: String },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Sum { .. } => TaskKind::Sum,
            TaskPayload::Multiply { .. } => TaskKind::Multiply,
            TaskPayload::Sort { .. } => TaskKind::Sort,
            TaskPayload::Hash { .. } => TaskKind::Hash,
            TaskPayload::Factorial { .. } => TaskKind::Factorial,
            TaskPayload::PrimeCheck { .. } => TaskKind::PrimeCheck,
            TaskPayload::MatrixMultiply { .. } => TaskKind::MatrixMultiply,
            TaskPayload::TextAnalysis { .. } => TaskKind::TextAnalysis,
        }
    }

    /// Canonical wire bytes for this payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskError> {
        let value = serde_json::to_value(self)
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        Ok(taskmesh_core::canonical::canonicalize(&value).into_bytes())
    }
}

/// Parameters supplied by the issuer when submitting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub payload: TaskPayload,
    pub reward: FixedPoint,
    pub deadline_ms: Timestamp,
    #[serde(default = "default_redundancy")]
    pub redundancy: u32,
    #[serde(default = "default_quorum")]
    pub quorum: u32,
}

fn default_redundancy() -> u32 {
    DEFAULT_REDUNDANCY
}

fn default_quorum() -> u32 {
    DEFAULT_QUORUM
}

/// The immutable, content-addressed description of a task.
///
/// `task_hash` is derived from every other field, so any mutation produces
/// a different task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_hash: TaskHash,
    pub kind: TaskKind,
    pub reward: FixedPoint,
    pub deadline_ms: Timestamp,
    pub quorum: u32,
    pub redundancy: u32,
    pub creator: NodeId,
    pub payload_hash: String,
    pub payload_size: usize,
}

impl TaskEnvelope {
    /// Build an envelope from a spec, returning the envelope together with
    /// the canonical payload bytes to be stored and distributed.
    pub fn from_spec(spec: &TaskSpec, creator: &str) -> Result<(Self, Vec<u8>), TaskError> {
        if spec.quorum == 0 || spec.redundancy == 0 {
            return Err(TaskError::InvalidPayload(
                "quorum and redundancy must be at least 1".to_string(),
            ));
        }
        if spec.quorum > spec.redundancy {
            return Err(TaskError::InvalidPayload(format!(
                "quorum {} exceeds redundancy {}",
                spec.quorum, spec.redundancy
            )));
        }
        if spec.reward < FixedPoint::ZERO {
            return Err(TaskError::InvalidPayload("reward must be non-negative".to_string()));
        }

        let payload_bytes = spec.payload.to_bytes()?;
        let payload_hash = sha256_hex(&payload_bytes);
        let kind = spec.payload.kind();

        let body = json!({
            "kind": kind,
            "reward": spec.reward,
            "deadline_ms": spec.deadline_ms,
            "quorum": spec.quorum,
            "redundancy": spec.redundancy,
            "creator": creator,
            "payload_hash": payload_hash,
            "payload_size": payload_bytes.len(),
        });
        let task_hash = value_address(&body);

        Ok((
            Self {
                task_hash,
                kind,
                reward: spec.reward,
                deadline_ms: spec.deadline_ms,
                quorum: spec.quorum,
                redundancy: spec.redundancy,
                creator: creator.to_string(),
                payload_hash,
                payload_size: payload_bytes.len(),
            },
            payload_bytes,
        ))
    }

    /// Recompute the content address from this envelope's fields.
    pub fn computed_hash(&self) -> TaskHash {
        let body = json!({
            "kind": self.kind,
            "reward": self.reward,
            "deadline_ms": self.deadline_ms,
            "quorum": self.quorum,
            "redundancy": self.redundancy,
            "creator": self.creator,
            "payload_hash": self.payload_hash,
            "payload_size": self.payload_size,
        });
        value_address(&body)
    }

    /// Whether the claimed task hash matches the envelope content. Any
    /// envelope arriving over the wire must pass this before it is stored.
    pub fn hash_is_valid(&self) -> bool {
        self.task_hash == self.computed_hash()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.deadline_ms
    }

    /// High-value tasks gate claimants on reputation.
    pub fn is_high_value(&self) -> bool {
        self.reward >= HIGH_VALUE_REWARD
    }

    /// Parse and validate payload bytes against this envelope.
    ///
    /// Rejects payloads whose hash or declared kind does not match, so a
    /// fetched payload can never silently stand in for a different task's
    /// input.
    pub fn decode_payload(&self, bytes: &[u8]) -> Result<TaskPayload, TaskError> {
        if sha256_hex(bytes) != self.payload_hash {
            return Err(TaskError::InvalidPayload("payload hash mismatch".to_string()));
        }
        let payload: TaskPayload = serde_json::from_slice(bytes)
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        if payload.kind() != self.kind {
            return Err(TaskError::InvalidPayload(format!(
                "payload kind {} does not match envelope kind {}",
                payload.kind().as_str(),
                self.kind.as_str()
            )));
        }
        Ok(payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskHash),
}

/// A task known to this node, with whatever payload bytes it has fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    pub envelope: TaskEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at_ms: Option<Timestamp>,
}

/// Content-addressed store of task envelopes and payloads.
///
/// Inserts are idempotent on the task hash. Settled tasks are retained for
/// a grace window so late messages still resolve, then garbage collected.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContentStore {
    tasks: HashMap<TaskHash, StoredTask>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an envelope. Returns false if the task was already known.
    pub fn insert(&mut self, envelope: TaskEnvelope) -> bool {
        if self.tasks.contains_key(&envelope.task_hash) {
            return false;
        }
        self.tasks.insert(
            envelope.task_hash.clone(),
            StoredTask { envelope, payload: None, settled_at_ms: None },
        );
        true
    }

    pub fn get(&self, task_hash: &str) -> Option<&StoredTask> {
        self.tasks.get(task_hash)
    }

    pub fn contains(&self, task_hash: &str) -> bool {
        self.tasks.contains_key(task_hash)
    }

    /// Attach payload bytes to a known task, verifying them first.
    pub fn store_payload(&mut self, task_hash: &str, bytes: Vec<u8>) -> Result<(), TaskError> {
        let stored = self
            .tasks
            .get_mut(task_hash)
            .ok_or_else(|| TaskError::UnknownTask(task_hash.to_string()))?;
        stored.envelope.decode_payload(&bytes)?;
        stored.payload = Some(bytes);
        Ok(())
    }

    pub fn payload(&self, task_hash: &str) -> Option<&[u8]> {
        self.tasks.get(task_hash).and_then(|t| t.payload.as_deref())
    }

    pub fn mark_settled(&mut self, task_hash: &str, now_ms: i64) {
        if let Some(stored) = self.tasks.get_mut(task_hash) {
            stored.settled_at_ms = Some(now_ms);
        }
    }

    pub fn is_settled(&self, task_hash: &str) -> bool {
        self.tasks
            .get(task_hash)
            .is_some_and(|t| t.settled_at_ms.is_some())
    }

    /// Drop settled tasks older than the retention window. Returns how many
    /// were removed.
    pub fn gc(&mut self, now_ms: i64) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| match t.settled_at_ms {
            Some(settled) => now_ms - settled < SETTLEMENT_RETENTION_MS,
            None => true,
        });
        before - self.tasks.len()
    }

    /// Tasks that are neither settled nor past deadline.
    pub fn open_tasks(&self, now_ms: i64) -> Vec<&TaskEnvelope> {
        self.tasks
            .values()
            .filter(|t| t.settled_at_ms.is_none() && !t.envelope.is_expired(now_ms))
            .map(|t| &t.envelope)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
