//! The execution sandbox: budgets, isolation, and output hashing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use taskmesh_core::canonical::{canonicalize, sha256_hex};
use taskmesh_core::types::TaskHash;
use taskmesh_protocol::task::{TaskEnvelope, TaskError, TaskPayload};

use crate::limits::ResourceLimits;
use crate::runner;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Execution exceeded wall clock limit of {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Task crashed: {0}")]
    Crashed(String),
}

impl From<TaskError> for ExecutionError {
    fn from(err: TaskError) -> Self {
        ExecutionError::InvalidPayload(err.to_string())
    }
}

/// The outcome of a successful execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub task_hash: TaskHash,
    pub output: Value,
    /// SHA-256 of the canonical JSON output. This is what peers compare
    /// during verification.
    pub output_hash: String,
    pub wall_clock_ms: u64,
}

/// Executes task payloads under resource limits.
///
/// Work runs on the blocking thread pool so a long computation never stalls
/// the node's event loop; a panicking runner is caught and reported as
/// `Crashed` rather than taking the worker down.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: ResourceLimits,
}

impl Sandbox {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Execute a task's payload bytes against its envelope.
    pub async fn execute(
        &self,
        envelope: &TaskEnvelope,
        payload_bytes: &[u8],
    ) -> Result<ExecutionReport, ExecutionError> {
        let payload = envelope.decode_payload(payload_bytes)?;
        runner::validate(&payload, self.limits.max_memory_bytes)?;
        debug!(task = %envelope.task_hash, kind = envelope.kind.as_str(), "Executing task");

        let limit_ms = self.limits.effective_wall_ms();
        let started = Instant::now();

        let handle = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(|| runner::run(&payload)))
        });

        let joined = tokio::time::timeout(Duration::from_millis(limit_ms), handle)
            .await
            .map_err(|_| {
                warn!(task = %envelope.task_hash, limit_ms, "Execution timed out");
                ExecutionError::Timeout { limit_ms }
            })?;

        let output = match joined {
            Ok(Ok(result)) => result?,
            Ok(Err(panic)) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                warn!(task = %envelope.task_hash, %msg, "Runner panicked");
                return Err(ExecutionError::Crashed(msg));
            }
            Err(join_err) => return Err(ExecutionError::Crashed(join_err.to_string())),
        };

        let output_hash = sha256_hex(canonicalize(&output).as_bytes());
        let wall_clock_ms = started.elapsed().as_millis() as u64;

        debug!(task = %envelope.task_hash, %output_hash, wall_clock_ms, "Execution complete");
        Ok(ExecutionReport {
            task_hash: envelope.task_hash.clone(),
            output,
            output_hash,
            wall_clock_ms,
        })
    }
}

/// Re-execute a payload and check it reproduces a claimed output hash.
pub async fn reproduces(
    sandbox: &Sandbox,
    envelope: &TaskEnvelope,
    payload_bytes: &[u8],
    claimed_output_hash: &str,
) -> Result<bool, ExecutionError> {
    let report = sandbox.execute(envelope, payload_bytes).await?;
    Ok(report.output_hash == claimed_output_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::types::FixedPoint;
    use taskmesh_protocol::task::TaskSpec;

    fn spec(payload: TaskPayload) -> TaskSpec {
        TaskSpec {
            payload,
            reward: FixedPoint::from_f64(1.0),
            deadline_ms: 2_000_000_000_000,
            redundancy: 3,
            quorum: 2,
        }
    }

    #[tokio::test]
    async fn execute_produces_stable_output_hash() {
        let sandbox = Sandbox::default();
        let (envelope, bytes) =
            TaskEnvelope::from_spec(&spec(TaskPayload::Sort { numbers: vec![5, 2, 9] }), "c")
                .unwrap();

        let a = sandbox.execute(&envelope, &bytes).await.unwrap();
        let b = sandbox.execute(&envelope, &bytes).await.unwrap();
        assert_eq!(a.output_hash, b.output_hash);
        assert_eq!(a.output["sorted"], serde_json::json!([2, 5, 9]));
    }

    #[tokio::test]
    async fn different_payloads_different_hashes() {
        let sandbox = Sandbox::default();
        let (env_a, bytes_a) =
            TaskEnvelope::from_spec(&spec(TaskPayload::Sum { numbers: vec![1, 2] }), "c").unwrap();
        let (env_b, bytes_b) =
            TaskEnvelope::from_spec(&spec(TaskPayload::Sum { numbers: vec![1, 3] }), "c").unwrap();

        let a = sandbox.execute(&env_a, &bytes_a).await.unwrap();
        let b = sandbox.execute(&env_b, &bytes_b).await.unwrap();
        assert_ne!(a.output_hash, b.output_hash);
    }

    #[tokio::test]
    async fn execute_rejects_foreign_payload() {
        let sandbox = Sandbox::default();
        let (envelope, _) =
            TaskEnvelope::from_spec(&spec(TaskPayload::Sum { numbers: vec![1, 2] }), "c").unwrap();
        let err = sandbox.execute(&envelope, b"not the payload").await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn memory_budget_enforced_before_running() {
        let sandbox = Sandbox::new(ResourceLimits {
            max_memory_bytes: 64,
            ..Default::default()
        });
        let (envelope, bytes) =
            TaskEnvelope::from_spec(&spec(TaskPayload::Sort { numbers: vec![0; 100] }), "c")
                .unwrap();
        let err = sandbox.execute(&envelope, &bytes).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExceeded(_)));
    }

    #[tokio::test]
    async fn reproduces_detects_mismatch() {
        let sandbox = Sandbox::default();
        let (envelope, bytes) =
            TaskEnvelope::from_spec(&spec(TaskPayload::PrimeCheck { n: 97 }), "c").unwrap();
        let report = sandbox.execute(&envelope, &bytes).await.unwrap();

        assert!(reproduces(&sandbox, &envelope, &bytes, &report.output_hash).await.unwrap());
        assert!(!reproduces(&sandbox, &envelope, &bytes, "bogus-hash").await.unwrap());
    }
}
