//! Aggregated node state with persistence for crash recovery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use taskmesh_core::types::{FixedPoint, NodeId, TaskHash};
use taskmesh_network::distribution::ChunkTracker;
use taskmesh_protocol::claims::{Claim, ClaimError, ClaimTable};
use taskmesh_protocol::ledger::{EntryReason, Ledger, LedgerEntry};
use taskmesh_protocol::reputation::ReputationTracker;
use taskmesh_protocol::task::{ContentStore, TaskEnvelope, TaskError, TaskSpec};
use taskmesh_protocol::verify::{
    SubmitError, SubmittedResult, VerificationEngine, VerificationRecord,
};

/// Checkpoint cadence: whichever of time or event count trips first.
const CHECKPOINT_INTERVAL_SECS: u64 = 300;
const CHECKPOINT_EVENT_THRESHOLD: u64 = 100;

/// Aggregated protocol state for the node.
pub struct NodeState {
    local_id: NodeId,
    pub tasks: ContentStore,
    pub claims: HashMap<TaskHash, ClaimTable>,
    pub engine: VerificationEngine,
    pub reputation: ReputationTracker,
    pub ledger: Ledger,
    /// In-flight payload downloads, by task hash.
    pub downloads: HashMap<TaskHash, ChunkTracker>,
    /// When set, the node stops claiming new tasks (resource exhaustion).
    claims_halted: bool,

    events_since_checkpoint: u64,
    last_checkpoint: Instant,
}

impl NodeState {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            tasks: ContentStore::new(),
            claims: HashMap::new(),
            engine: VerificationEngine::new(),
            reputation: ReputationTracker::new(),
            ledger: Ledger::new(),
            downloads: HashMap::new(),
            claims_halted: false,
            events_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Publish a task we issue ourselves: envelope, escrow, claim table.
    /// Idempotent on the envelope hash; re-publishing is a no-op that
    /// returns the same envelope.
    pub fn submit_task(
        &mut self,
        spec: &TaskSpec,
        now_ms: i64,
    ) -> Result<(TaskEnvelope, Vec<u8>), TaskError> {
        let (envelope, payload) = TaskEnvelope::from_spec(spec, &self.local_id)?;
        if self.tasks.insert(envelope.clone()) {
            self.engine.register_task(&mut self.ledger, &envelope, now_ms);
            self.claims.insert(envelope.task_hash.clone(), ClaimTable::new(&envelope));
            self.tasks
                .store_payload(&envelope.task_hash, payload.clone())?;
            self.record_event();
        }
        Ok((envelope, payload))
    }

    /// Track a task announced by another peer. Returns false for a replay
    /// or an envelope whose hash does not check out.
    pub fn track_remote_task(&mut self, envelope: TaskEnvelope, now_ms: i64) -> bool {
        if !envelope.hash_is_valid() {
            debug!(task = %envelope.task_hash, "Dropping envelope with bad hash");
            return false;
        }
        if !self.tasks.insert(envelope.clone()) {
            return false;
        }
        self.engine.register_task(&mut self.ledger, &envelope, now_ms);
        self.claims.insert(envelope.task_hash.clone(), ClaimTable::new(&envelope));
        self.record_event();
        true
    }

    /// Accept a claim (local or remote) for a tracked task.
    pub fn try_claim(
        &mut self,
        task_hash: &str,
        claimant: &str,
        now_ms: i64,
    ) -> Result<Claim, ClaimError> {
        let Some(stored) = self.tasks.get(task_hash) else {
            return Err(ClaimError::TaskUnavailable(task_hash.to_string()));
        };
        if self.tasks.is_settled(task_hash) {
            return Err(ClaimError::TaskUnavailable(task_hash.to_string()));
        }
        let eligible = self.reputation.is_eligible(claimant, stored.envelope.reward);
        let table = self
            .claims
            .get_mut(task_hash)
            .ok_or_else(|| ClaimError::TaskUnavailable(task_hash.to_string()))?;
        let claim = table.claim(claimant, now_ms, eligible)?;
        self.engine.register_claimant(task_hash, claimant);
        self.record_event();
        Ok(claim)
    }

    /// Whether this node should claim a task for itself right now.
    pub fn should_claim(&self, envelope: &TaskEnvelope, now_ms: i64) -> bool {
        if self.claims_halted || envelope.creator == self.local_id {
            return false;
        }
        if envelope.is_expired(now_ms) || self.tasks.is_settled(&envelope.task_hash) {
            return false;
        }
        if !self.reputation.is_eligible(&self.local_id, envelope.reward) {
            return false;
        }
        self.claims
            .get(&envelope.task_hash)
            .map(|t| !t.is_full() && !t.has_claim(&self.local_id))
            .unwrap_or(false)
    }

    pub fn withdraw_claim(&mut self, task_hash: &str, claimant: &str) -> bool {
        let withdrew = self
            .claims
            .get_mut(task_hash)
            .is_some_and(|t| t.withdraw(claimant));
        if withdrew {
            self.record_event();
        }
        withdrew
    }

    /// Fold in a submitted result and settle if quorum is reached.
    ///
    /// A result implies a claim, so the claimant is first run through the
    /// same gates as a CLAIM message. A result that outruns its claim
    /// gossip still counts; a peer the gates turn away holds no slot and
    /// fails `NotAClaimant` in the engine.
    pub fn record_result(
        &mut self,
        result: SubmittedResult,
        now_ms: i64,
    ) -> Result<Option<VerificationRecord>, SubmitError> {
        let task_hash = result.task_hash.clone();
        if let Err(err) = self.try_claim(&task_hash, &result.claimant, now_ms) {
            debug!(task = %task_hash, claimant = %result.claimant, %err,
                   "Result carries no admissible claim");
        }
        self.engine.submit_result(result)?;
        self.record_event();
        Ok(self.finalize(&task_hash, now_ms))
    }

    fn finalize(&mut self, task_hash: &str, now_ms: i64) -> Option<VerificationRecord> {
        let record = self.engine.try_finalize(task_hash, now_ms, &mut self.ledger)?;
        self.apply_settlement(&record, now_ms);
        Some(record)
    }

    fn apply_settlement(&mut self, record: &VerificationRecord, now_ms: i64) {
        self.reputation.on_verification_record(record);
        self.tasks.mark_settled(&record.task_hash, now_ms);
        if let Some(table) = self.claims.get_mut(&record.task_hash) {
            table.mark_settled();
        }
        self.record_event();
    }

    /// Periodic housekeeping: settle overdue tasks, decay idle reputation,
    /// collect settled state past retention.
    pub fn maintenance(&mut self, now_ms: i64) -> Vec<VerificationRecord> {
        let records = self.engine.finalize_expired(now_ms, &mut self.ledger);
        for record in &records {
            self.apply_settlement(record, now_ms);
        }

        self.reputation.decay_inactive(now_ms);

        let removed = self.tasks.gc(now_ms);
        if removed > 0 {
            debug!(removed, "Collected settled tasks");
            let tasks = &self.tasks;
            self.engine.gc(|hash| tasks.contains(hash));
            self.claims.retain(|hash, _| tasks.contains(hash));
            self.downloads.retain(|hash, _| tasks.contains(hash));
        }
        records
    }

    /// Seed a participant's balance. Used once per known peer, mirroring
    /// the starting grant new nodes announce with.
    pub fn grant_initial(&mut self, peer: &str, amount: FixedPoint, now_ms: i64) {
        if self.ledger.entries_for(peer).next().is_some() {
            return;
        }
        self.ledger.append(LedgerEntry {
            peer: peer.to_string(),
            delta: amount,
            reason: EntryReason::InitialGrant,
            task: None,
            timestamp_ms: now_ms,
        });
    }

    pub fn balance(&self, peer: &str) -> FixedPoint {
        self.ledger.balance(peer)
    }

    pub fn claims_halted(&self) -> bool {
        self.claims_halted
    }

    /// Stop or resume claiming new tasks.
    pub fn set_claims_halted(&mut self, halted: bool) {
        if self.claims_halted != halted {
            info!(halted, "Claim intake toggled");
        }
        self.claims_halted = halted;
    }

    pub fn record_event(&mut self) -> bool {
        self.events_since_checkpoint += 1;
        self.should_checkpoint()
    }

    pub fn should_checkpoint(&self) -> bool {
        self.events_since_checkpoint >= CHECKPOINT_EVENT_THRESHOLD
            || self.last_checkpoint.elapsed().as_secs() >= CHECKPOINT_INTERVAL_SECS
    }

    pub fn mark_checkpointed(&mut self) {
        self.events_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
    }
}

// ─── Persistence via a serializable snapshot ─────────────────────────

/// Serializable snapshot of the durable parts of state. Claims and
/// unsettled results are soft state re-learned from gossip; the ledger,
/// reputation, and tracked tasks survive restarts.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub ledger: Ledger,
    pub reputation: ReputationTracker,
    pub tasks: ContentStore,
}

/// Borrowed view of state for saving without cloning the ledger.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    ledger: &'a Ledger,
    reputation: &'a ReputationTracker,
    tasks: &'a ContentStore,
}

/// State directory layout under the base path:
///
/// ```text
/// <base>/
///   identity.key       — 32-byte Ed25519 seed
///   state.json         — latest state snapshot
///   state.json.bak     — previous snapshot (crash safety)
/// ```
pub struct StatePersistence {
    base_dir: PathBuf,
}

impl StatePersistence {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create state dir: {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    /// Default base directory: ~/.taskmesh-node/
    pub fn default_dir() -> PathBuf {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".taskmesh-node")
    }

    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join("state.json")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.base_dir.join("state.json.bak")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.base_dir.join("identity.key")
    }

    /// Save a checkpoint with atomic rename for crash safety.
    pub fn save(&self, state: &NodeState) -> Result<()> {
        let path = self.state_path();
        let backup = self.backup_path();

        let snapshot = SnapshotRef {
            ledger: &state.ledger,
            reputation: &state.reputation,
            tasks: &state.tasks,
        };
        let data =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize state snapshot")?;

        if path.exists() {
            std::fs::copy(&path, &backup).ok();
        }

        // Write via temp file with fsync, then rename over the old snapshot.
        let tmp = self.base_dir.join("state.json.tmp");
        {
            use std::io::Write;
            let mut file =
                std::fs::File::create(&tmp).context("Failed to create temp state file")?;
            file.write_all(data.as_bytes())
                .context("Failed to write temp state file")?;
            file.sync_all().context("Failed to fsync temp state file")?;
        }
        std::fs::rename(&tmp, &path).context("Failed to rename temp state file")?;
        if let Ok(dir) = std::fs::File::open(&self.base_dir) {
            let _ = dir.sync_all();
        }

        debug!(path = %path.display(), bytes = data.len(), "State checkpoint saved");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state from {}", path.display()))?;
        let snapshot: StateSnapshot =
            serde_json::from_str(&data).context("Failed to parse state snapshot")?;
        info!(path = %path.display(), "Loaded state snapshot");
        Ok(Some(snapshot))
    }

    /// Load identity seed from disk. Refuses world-readable key files.
    pub fn load_identity_seed(&self) -> Result<Option<[u8; 32]>> {
        let path = self.identity_path();
        if !path.exists() {
            return Ok(None);
        }
        self.check_identity_permissions()?;

        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read identity from {}", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Identity file must be exactly 32 bytes"))?;
        Ok(Some(seed))
    }

    /// Save identity seed with restricted permissions (0600).
    pub fn save_identity_seed(&self, seed: &[u8; 32]) -> Result<()> {
        let path = self.identity_path();
        std::fs::write(&path, seed)
            .with_context(|| format!("Failed to write identity to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        info!(path = %path.display(), "Identity seed saved (mode 0600)");
        Ok(())
    }

    fn check_identity_permissions(&self) -> Result<()> {
        let path = self.identity_path();
        if !path.exists() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(&path)
                .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                anyhow::bail!(
                    "Identity key file {} has insecure permissions {:04o}. \
                     Expected 0600 (owner read/write only). \
                     Fix with: chmod 600 {}",
                    path.display(),
                    mode,
                    path.display()
                );
            }
        }

        Ok(())
    }
}

/// Apply a loaded snapshot to a fresh NodeState. Verification trackers for
/// unsettled tasks are resumed without re-escrowing; claims and partial
/// results are re-learned from gossip.
pub fn restore_from_snapshot(state: &mut NodeState, snapshot: StateSnapshot, now_ms: i64) {
    state.ledger = snapshot.ledger;
    state.reputation = snapshot.reputation;
    state.tasks = snapshot.tasks;

    let open: Vec<TaskEnvelope> = state
        .tasks
        .open_tasks(now_ms)
        .into_iter()
        .cloned()
        .collect();
    for envelope in open {
        state.engine.resume_task(&envelope);
        state
            .claims
            .insert(envelope.task_hash.clone(), ClaimTable::new(&envelope));
    }

    info!(
        ledger_entries = state.ledger.len(),
        tasks = state.tasks.len(),
        "Restored state from snapshot"
    );
}

/// Starting balance granted to peers we first interact with.
pub fn default_initial_grant() -> FixedPoint {
    FixedPoint::from_f64(100.0)
}
