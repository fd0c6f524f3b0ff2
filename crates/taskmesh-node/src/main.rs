//! Taskmesh node daemon.
//!
//! Wires the swarm, the protocol state, and the sandbox together: gossip
//! messages flow through the handler, claimed payloads are fetched over the
//! chunk protocol, executions run in the sandbox, and results are signed
//! and published back to the network.

mod handler;
mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::{Multiaddr, PeerId};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use taskmesh_core::message::{
    ClaimWithdrawPayload, MessageType, ReputationAssessment, ReputationGossipPayload,
    TaskAnnouncePayload, TaskResultPayload,
};
use taskmesh_core::types::TaskHash;
use taskmesh_crypto::identity::NodeIdentity;
use taskmesh_crypto::signing::sign_message;
use taskmesh_network::distribution::{pick_peer, Backoff, ChunkTracker};
use taskmesh_network::swarm::TaskmeshSwarm;
use taskmesh_network::transport::{TransportCommand, TransportConfig, TransportEvent};
use taskmesh_protocol::task::{TaskEnvelope, TaskSpec};
use taskmesh_protocol::verify::{attestation_hash, SubmittedResult};
use taskmesh_sandbox::{ExecutionError, ExecutionReport, Sandbox};

use state::{restore_from_snapshot, NodeState, StatePersistence};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const REPUTATION_GOSSIP_INTERVAL: Duration = Duration::from_secs(300);
const DOWNLOAD_RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct NodeArgs {
    listen_addrs: Vec<Multiaddr>,
    bootstrap_peers: Vec<Multiaddr>,
    state_dir: PathBuf,
    enable_mdns: bool,
    submit: Option<PathBuf>,
}

fn print_help() {
    println!(
        "taskmesh-node — decentralized task distribution and verification\n\
         \n\
         USAGE:\n\
         \x20   taskmesh-node [OPTIONS]\n\
         \n\
         OPTIONS:\n\
         \x20   --listen <MULTIADDR>     Listen address (repeatable, default /ip4/0.0.0.0/tcp/0)\n\
         \x20   --bootstrap <MULTIADDR>  Bootstrap peer to dial (repeatable)\n\
         \x20   --state-dir <PATH>       State directory (default ~/.taskmesh-node)\n\
         \x20   --submit <FILE>          Submit a task spec (JSON) on startup\n\
         \x20   --no-mdns                Disable local peer discovery\n\
         \x20   --help                   Show this help"
    );
}

fn parse_args() -> Result<NodeArgs> {
    let mut args = NodeArgs {
        listen_addrs: Vec::new(),
        bootstrap_peers: Vec::new(),
        state_dir: StatePersistence::default_dir(),
        enable_mdns: true,
        submit: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" => {
                let addr = iter.next().context("--listen requires a multiaddr")?;
                args.listen_addrs
                    .push(addr.parse().with_context(|| format!("Invalid multiaddr: {addr}"))?);
            }
            "--bootstrap" => {
                let addr = iter.next().context("--bootstrap requires a multiaddr")?;
                args.bootstrap_peers
                    .push(addr.parse().with_context(|| format!("Invalid multiaddr: {addr}"))?);
            }
            "--state-dir" => {
                let dir = iter.next().context("--state-dir requires a path")?;
                args.state_dir = PathBuf::from(dir);
            }
            "--submit" => {
                let file = iter.next().context("--submit requires a file path")?;
                args.submit = Some(PathBuf::from(file));
            }
            "--no-mdns" => args.enable_mdns = false,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("Unknown argument: {other} (try --help)"),
        }
    }
    Ok(args)
}

/// Per-download bookkeeping the tracker itself does not carry: which peers
/// serve the payload, a rolling request counter for round-robin, and the
/// backoff schedule for re-querying providers.
#[derive(Default)]
struct DownloadPeers {
    providers: Vec<PeerId>,
    request_seq: usize,
    backoff: Backoff,
    next_probe_at_ms: i64,
}

/// Outcome of one sandboxed execution, sent back to the node loop.
struct ExecOutcome {
    task_hash: TaskHash,
    result: std::result::Result<ExecutionReport, ExecutionError>,
}

struct Node {
    identity: NodeIdentity,
    state: NodeState,
    persistence: StatePersistence,
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    exec_tx: mpsc::UnboundedSender<ExecOutcome>,
    download_peers: HashMap<TaskHash, DownloadPeers>,
}

impl Node {
    fn publish(&self, msg_type: MessageType, payload: serde_json::Value) {
        let Some(topic) = msg_type.gossipsub_topic() else {
            warn!(kind = ?msg_type, "Attempted to gossip a stream-only message");
            return;
        };
        let envelope = sign_message(&self.identity, msg_type, payload, now_ms());
        let data = match serde_json::to_vec(&envelope) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Failed to encode envelope");
                return;
            }
        };
        if self
            .command_tx
            .send(TransportCommand::Publish { topic: topic.to_string(), data })
            .is_err()
        {
            error!("Transport channel closed");
        }
    }

    /// Issue a task from this node: escrow, announce, serve the payload.
    fn submit_local_task(&mut self, spec: &TaskSpec) -> Result<TaskEnvelope> {
        let (envelope, payload) = self.state.submit_task(spec, now_ms())?;
        info!(task = %envelope.task_hash, kind = %envelope.kind.as_str(),
              reward = %envelope.reward, "Submitting task");

        let _ = self.command_tx.send(TransportCommand::ServePayload {
            task_hash: envelope.task_hash.clone(),
            payload,
        });
        let _ = self.command_tx.send(TransportCommand::StartProviding {
            task_hash: envelope.task_hash.clone(),
        });
        self.publish(
            MessageType::TaskAnnounce,
            json!(TaskAnnouncePayload {
                task_hash: envelope.task_hash.clone(),
                kind: envelope.kind.as_str().to_string(),
                reward: envelope.reward,
                deadline_ms: envelope.deadline_ms,
                quorum: envelope.quorum,
                redundancy: envelope.redundancy,
                creator: envelope.creator.clone(),
                payload_hash: envelope.payload_hash.clone(),
                payload_size: envelope.payload_size as u64,
            }),
        );
        Ok(envelope)
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::GossipMessage { envelope, .. } => {
                let responses =
                    handler::handle_gossip_message(&mut self.state, &envelope, now_ms());
                for response in responses {
                    match response {
                        handler::HandlerResponse::Publish { msg_type, payload } => {
                            self.publish(msg_type, payload);
                        }
                        handler::HandlerResponse::FetchPayload { task_hash } => {
                            self.start_download(&task_hash);
                        }
                    }
                }
            }
            TransportEvent::ProvidersFound { task_hash, providers } => {
                self.on_providers_found(&task_hash, providers);
            }
            TransportEvent::ChunkReceived { task_hash, chunk_index, data, .. } => {
                self.on_chunk_received(&task_hash, chunk_index, data);
            }
            TransportEvent::ChunkFailed { peer_id, task_hash, chunk_index } => {
                debug!(task = %task_hash, chunk = chunk_index, peer = %peer_id,
                       "Chunk request failed, retrying elsewhere");
                if let Some(peers) = self.download_peers.get_mut(&task_hash) {
                    peers.providers.retain(|p| *p != peer_id);
                }
                self.request_next_chunk(&task_hash);
            }
            TransportEvent::PeerConnected { peer_id, .. } => {
                debug!(peer = %peer_id, "Peer connected");
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                debug!(peer = %peer_id, "Peer disconnected");
            }
        }
    }

    fn start_download(&mut self, task_hash: &str) {
        let Some(stored) = self.state.tasks.get(task_hash) else {
            return;
        };
        if stored.payload.is_some() {
            self.spawn_execution(task_hash);
            return;
        }
        let envelope = &stored.envelope;
        if !self.state.downloads.contains_key(task_hash) {
            info!(task = %task_hash, size = envelope.payload_size, "Fetching task payload");
            self.state.downloads.insert(
                task_hash.to_string(),
                ChunkTracker::new(task_hash, envelope.payload_size, &envelope.payload_hash),
            );
            self.download_peers.insert(task_hash.to_string(), DownloadPeers::default());
        }
        if let Some(peers) = self.download_peers.get_mut(task_hash) {
            peers.next_probe_at_ms = now_ms() + peers.backoff.next_delay_ms();
        }
        let _ = self
            .command_tx
            .send(TransportCommand::FindProviders { task_hash: task_hash.to_string() });
    }

    /// Re-issue provider queries for downloads that have nobody to ask,
    /// spacing attempts with exponential backoff until a provider shows up
    /// or the task expires out of the store.
    fn retry_stalled_downloads(&mut self, now_ms: i64) {
        for (task_hash, peers) in self.download_peers.iter_mut() {
            if !peers.providers.is_empty() || now_ms < peers.next_probe_at_ms {
                continue;
            }
            let delay = peers.backoff.next_delay_ms();
            peers.next_probe_at_ms = now_ms + delay;
            debug!(task = %task_hash, next_retry_ms = delay, "Re-querying providers");
            let _ = self
                .command_tx
                .send(TransportCommand::FindProviders { task_hash: task_hash.clone() });
        }
    }

    fn on_providers_found(&mut self, task_hash: &str, providers: Vec<PeerId>) {
        let Some(peers) = self.download_peers.get_mut(task_hash) else {
            return;
        };
        let mut new_providers = 0;
        for provider in providers {
            if !peers.providers.contains(&provider) {
                peers.providers.push(provider);
                new_providers += 1;
            }
        }
        if new_providers > 0 {
            peers.backoff.reset();
            if let Some(tracker) = self.state.downloads.get_mut(task_hash) {
                for _ in 0..new_providers {
                    tracker.record_full_peer();
                }
            }
            self.request_next_chunk(task_hash);
        }
    }

    fn request_next_chunk(&mut self, task_hash: &str) {
        let Some(tracker) = self.state.downloads.get(task_hash) else {
            return;
        };
        let Some(chunk_index) = tracker.next_needed() else {
            return;
        };
        let Some(peers) = self.download_peers.get_mut(task_hash) else {
            return;
        };
        let Some(peer_id) = pick_peer(&peers.providers, peers.request_seq).cloned() else {
            let delay = peers.backoff.next_delay_ms();
            peers.next_probe_at_ms = now_ms() + delay;
            debug!(task = %task_hash, next_retry_ms = delay,
                   "No providers left, backing off before re-query");
            return;
        };
        peers.request_seq += 1;

        let _ = self.command_tx.send(TransportCommand::RequestChunk {
            peer_id,
            task_hash: task_hash.to_string(),
            chunk_index,
        });
    }

    fn on_chunk_received(&mut self, task_hash: &str, chunk_index: usize, data: Vec<u8>) {
        let Some(tracker) = self.state.downloads.get_mut(task_hash) else {
            return;
        };
        if let Err(e) = tracker.accept(chunk_index, data) {
            debug!(task = %task_hash, chunk = chunk_index, error = %e, "Chunk rejected");
            self.request_next_chunk(task_hash);
            return;
        }

        if !tracker.is_complete() {
            self.request_next_chunk(task_hash);
            return;
        }
        let payload = match tracker.assemble() {
            Ok(payload) => payload,
            Err(e) => {
                // A corrupt download cannot be repaired chunk by chunk; the
                // whole payload is discarded and the claim released.
                warn!(task = %task_hash, error = %e, "Payload verification failed");
                self.abandon_task(task_hash);
                return;
            }
        };
        self.state.downloads.remove(task_hash);
        self.download_peers.remove(task_hash);

        if let Err(e) = self.state.tasks.store_payload(task_hash, payload.clone()) {
            warn!(task = %task_hash, error = %e, "Payload rejected by store");
            self.abandon_task(task_hash);
            return;
        }
        info!(task = %task_hash, bytes = payload.len(), "Payload fetched, serving and executing");
        let _ = self.command_tx.send(TransportCommand::ServePayload {
            task_hash: task_hash.to_string(),
            payload,
        });
        let _ = self
            .command_tx
            .send(TransportCommand::StartProviding { task_hash: task_hash.to_string() });
        self.spawn_execution(task_hash);
    }

    fn spawn_execution(&mut self, task_hash: &str) {
        let Some(stored) = self.state.tasks.get(task_hash) else {
            return;
        };
        let Some(payload) = stored.payload.clone() else {
            return;
        };
        let envelope = stored.envelope.clone();
        let exec_tx = self.exec_tx.clone();

        tokio::spawn(async move {
            let sandbox = Sandbox::default();
            let task_hash = envelope.task_hash.clone();
            let result = sandbox.execute(&envelope, &payload).await;
            let _ = exec_tx.send(ExecOutcome { task_hash, result });
        });
    }

    fn handle_exec_outcome(&mut self, outcome: ExecOutcome) {
        let local_id = self.state.local_id().to_string();
        match outcome.result {
            Ok(report) => {
                let attestation =
                    attestation_hash(&outcome.task_hash, &report.output_hash, &local_id);
                info!(task = %outcome.task_hash, output = %report.output_hash,
                      wall_ms = report.wall_clock_ms, "Execution complete");

                self.publish(
                    MessageType::TaskResult,
                    json!(TaskResultPayload {
                        task_hash: outcome.task_hash.clone(),
                        claimant: local_id.clone(),
                        output_hash: report.output_hash.clone(),
                        attestation: attestation.clone(),
                    }),
                );
                let now = now_ms();
                let result = SubmittedResult {
                    task_hash: outcome.task_hash,
                    claimant: local_id,
                    output_hash: report.output_hash,
                    attestation,
                    submitted_at_ms: now,
                };
                match self.state.record_result(result, now) {
                    Ok(Some(record)) => {
                        info!(task = %record.task_hash, "Task settled locally");
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Own result not recorded"),
                }
                if self.state.claims_halted() {
                    info!("Execution headroom recovered, accepting claims again");
                    self.state.set_claims_halted(false);
                }
            }
            Err(e) => {
                warn!(task = %outcome.task_hash, error = %e, "Execution failed, withdrawing claim");
                if matches!(e, ExecutionError::ResourceExceeded(_)) && !self.state.claims_halted() {
                    warn!("Local resource limits hit, halting new claims");
                    self.state.set_claims_halted(true);
                }
                self.abandon_task(&outcome.task_hash);
            }
        }
    }

    /// Release our claim on a task we can no longer complete.
    fn abandon_task(&mut self, task_hash: &str) {
        self.state.downloads.remove(task_hash);
        self.download_peers.remove(task_hash);
        let local_id = self.state.local_id().to_string();
        if self.state.withdraw_claim(task_hash, &local_id) {
            self.publish(
                MessageType::ClaimWithdraw,
                json!(ClaimWithdrawPayload {
                    task_hash: task_hash.to_string(),
                    claimant: local_id,
                }),
            );
        }
    }

    fn run_maintenance(&mut self) {
        let now = now_ms();
        let records = self.state.maintenance(now);
        for record in &records {
            info!(task = %record.task_hash, outcome = ?record.outcome, "Deadline settlement");
            let _ = self.command_tx.send(TransportCommand::StopServing {
                task_hash: record.task_hash.clone(),
            });
        }

        if self.state.should_checkpoint() {
            match self.persistence.save(&self.state) {
                Ok(()) => self.state.mark_checkpointed(),
                Err(e) => error!(error = %e, "State checkpoint failed"),
            }
        }
    }

    fn gossip_reputation(&mut self) {
        let assessments: Vec<ReputationAssessment> = self
            .state
            .reputation
            .local_assessments()
            .into_iter()
            .map(|(node_id, score)| ReputationAssessment { node_id, score })
            .collect();
        if assessments.is_empty() {
            return;
        }
        debug!(count = assessments.len(), "Gossiping reputation assessments");
        self.publish(
            MessageType::ReputationGossip,
            json!(ReputationGossipPayload { assessments }),
        );
    }
}

fn load_or_create_identity(persistence: &StatePersistence) -> Result<NodeIdentity> {
    if let Some(seed) = persistence.load_identity_seed()? {
        let identity = NodeIdentity::from_seed(&seed);
        info!(node_id = %identity.node_id(), "Loaded identity");
        return Ok(identity);
    }
    let identity = NodeIdentity::generate();
    let seed = identity.signing_key().to_bytes();
    persistence.save_identity_seed(&seed)?;
    info!(node_id = %identity.node_id(), "Generated new identity");
    Ok(identity)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let persistence = StatePersistence::new(args.state_dir.clone())?;
    let identity = load_or_create_identity(&persistence)?;

    let mut state = NodeState::new(&identity.node_id());
    if let Some(snapshot) = persistence.load()? {
        restore_from_snapshot(&mut state, snapshot, now_ms());
    }

    let mut config = TransportConfig {
        bootstrap_peers: args.bootstrap_peers,
        enable_mdns: args.enable_mdns,
        ..TransportConfig::default()
    };
    if !args.listen_addrs.is_empty() {
        config.listen_addrs = args.listen_addrs;
    }

    let (mut swarm, command_tx, mut event_rx) = TaskmeshSwarm::new(identity.clone(), config)?;
    swarm.start_listening()?;
    info!(peer_id = %swarm.local_peer_id(), node_id = %identity.node_id(), "Node starting");

    tokio::spawn(async move {
        if let Err(e) = swarm.run().await {
            error!(error = %e, "Swarm terminated");
        }
    });

    let (exec_tx, mut exec_rx) = mpsc::unbounded_channel();
    let mut node = Node {
        identity,
        state,
        persistence,
        command_tx,
        exec_tx,
        download_peers: HashMap::new(),
    };

    if let Some(path) = &args.submit {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task spec from {}", path.display()))?;
        let spec: TaskSpec =
            serde_json::from_str(&raw).context("Failed to parse task spec JSON")?;
        node.submit_local_task(&spec)?;
    }

    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    let mut reputation = tokio::time::interval(REPUTATION_GOSSIP_INTERVAL);
    let mut download_retry = tokio::time::interval(DOWNLOAD_RETRY_INTERVAL);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => node.handle_transport_event(event),
                    None => {
                        error!("Transport event channel closed, shutting down");
                        break;
                    }
                }
            }
            outcome = exec_rx.recv() => {
                if let Some(outcome) = outcome {
                    node.handle_exec_outcome(outcome);
                }
            }
            _ = maintenance.tick() => node.run_maintenance(),
            _ = reputation.tick() => node.gossip_reputation(),
            _ = download_retry.tick() => node.retry_stalled_downloads(now_ms()),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    node.persistence.save(&node.state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::constants::BACKOFF_INITIAL_MS;
    use taskmesh_core::types::FixedPoint;
    use taskmesh_protocol::task::TaskPayload;
    use tempfile::TempDir;

    fn task_spec() -> TaskSpec {
        TaskSpec {
            payload: TaskPayload::Sum { numbers: vec![1, 2, 3] },
            reward: FixedPoint::from_f64(5.0),
            deadline_ms: now_ms() + 600_000,
            redundancy: 3,
            quorum: 2,
        }
    }

    fn test_node(
        tmp: &TempDir,
    ) -> (
        Node,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedReceiver<ExecOutcome>,
    ) {
        let identity = NodeIdentity::generate();
        let state = NodeState::new(&identity.node_id());
        let persistence = StatePersistence::new(tmp.path().to_path_buf()).unwrap();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let node = Node {
            identity,
            state,
            persistence,
            command_tx,
            exec_tx,
            download_peers: HashMap::new(),
        };
        (node, command_rx, exec_rx)
    }

    #[test]
    fn stalled_download_requeries_providers_with_backoff() {
        let tmp = TempDir::new().unwrap();
        let (mut node, mut commands, _exec) = test_node(&tmp);
        let (task, _) = TaskEnvelope::from_spec(&task_spec(), "issuer").unwrap();
        let now = now_ms();
        assert!(node.state.track_remote_task(task.clone(), now));

        node.start_download(&task.task_hash);
        assert!(matches!(
            commands.try_recv().unwrap(),
            TransportCommand::FindProviders { .. }
        ));

        // Within the first backoff window nothing is re-issued.
        node.retry_stalled_downloads(now);
        assert!(commands.try_recv().is_err());

        // Past the window the query goes out again; the next window has
        // doubled, so a moment later there is still nothing new.
        node.retry_stalled_downloads(now + BACKOFF_INITIAL_MS + 10_000);
        assert!(matches!(
            commands.try_recv().unwrap(),
            TransportCommand::FindProviders { .. }
        ));
        node.retry_stalled_downloads(now + BACKOFF_INITIAL_MS + 10_001);
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn empty_provider_set_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let (mut node, mut commands, _exec) = test_node(&tmp);
        let (task, _) = TaskEnvelope::from_spec(&task_spec(), "issuer").unwrap();
        assert!(node.state.track_remote_task(task.clone(), now_ms()));

        node.start_download(&task.task_hash);
        assert!(matches!(
            commands.try_recv().unwrap(),
            TransportCommand::FindProviders { .. }
        ));

        // A provider query that finds nobody leaves the download pending
        // for the next probe instead of failing or withdrawing the claim.
        node.on_providers_found(&task.task_hash, vec![]);
        assert!(node.state.downloads.contains_key(&task.task_hash));
        assert!(commands.try_recv().is_err());
    }
}
