//! Transport-layer types — GossipSub topics, peer directory, dedup cache.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};

use taskmesh_core::constants;
use taskmesh_core::message::Envelope;
use taskmesh_core::types::{NodeId, TaskHash};

/// GossipSub topic names.
pub const TOPIC_TASKS: &str = "/taskmesh/tasks";
pub const TOPIC_CLAIMS: &str = "/taskmesh/claims";
pub const TOPIC_RESULTS: &str = "/taskmesh/results";
pub const TOPIC_PEERS: &str = "/taskmesh/peers";

pub const ALL_TOPICS: [&str; 4] = [TOPIC_TASKS, TOPIC_CLAIMS, TOPIC_RESULTS, TOPIC_PEERS];

/// Stream protocol for chunked payload transfer.
pub const CHUNK_PROTOCOL: &str = "/taskmesh/chunks/1.0.0";

/// Events emitted by the transport layer to the node.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A validated, deduplicated message received via GossipSub.
    GossipMessage {
        topic: String,
        envelope: Envelope,
        source: PeerId,
    },
    /// A new peer connection was established.
    PeerConnected {
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
    },
    /// A peer disconnected or expired.
    PeerDisconnected { peer_id: PeerId },
    /// Providers found for a task payload via the DHT.
    ProvidersFound {
        task_hash: TaskHash,
        providers: Vec<PeerId>,
    },
    /// A payload chunk arrived from a peer.
    ChunkReceived {
        peer_id: PeerId,
        task_hash: TaskHash,
        chunk_index: usize,
        data: Vec<u8>,
        total_size: usize,
    },
    /// A chunk request failed or the peer did not hold the chunk.
    ChunkFailed {
        peer_id: PeerId,
        task_hash: TaskHash,
        chunk_index: usize,
    },
}

/// Commands sent to the transport layer from the node.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Publish a signed envelope to a GossipSub topic.
    Publish { topic: String, data: Vec<u8> },
    /// Dial a peer at the given address.
    Dial { addr: Multiaddr },
    /// Announce ourselves on the peers topic now.
    Announce,
    /// Advertise this node as a provider of a task payload.
    StartProviding { task_hash: TaskHash },
    /// Look up providers of a task payload.
    FindProviders { task_hash: TaskHash },
    /// Request one payload chunk from a peer.
    RequestChunk {
        peer_id: PeerId,
        task_hash: TaskHash,
        chunk_index: usize,
    },
    /// Hold a payload locally and answer chunk requests for it.
    ServePayload {
        task_hash: TaskHash,
        payload: Vec<u8>,
    },
    /// Stop serving a payload (e.g. after settlement GC).
    StopServing { task_hash: TaskHash },
}

/// What we know about a peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    /// Protocol-level identity, learned from the peer's signed announce.
    pub node_id: Option<NodeId>,
    pub addresses: Vec<Multiaddr>,
    pub last_seen_ms: i64,
    pub capabilities: Vec<String>,
    /// Tasks whose payloads this peer claims to serve.
    pub serving: HashSet<TaskHash>,
}

/// Directory of known peers, keyed by libp2p PeerId with a secondary index
/// on the protocol node ID. Entries expire after 30 minutes of silence.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, PeerInfo>,
    by_node_id: HashMap<NodeId, PeerId>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a peer. A re-announce under a new node ID replaces
    /// the old identity mapping.
    pub fn upsert(&mut self, info: PeerInfo) {
        if let Some(node_id) = &info.node_id {
            self.by_node_id.insert(node_id.clone(), info.peer_id);
        }
        if let Some(old) = self.peers.insert(info.peer_id, info) {
            if let Some(old_node_id) = &old.node_id {
                let current = self.peers.get(&old.peer_id).and_then(|p| p.node_id.as_ref());
                if current != Some(old_node_id) {
                    self.by_node_id.remove(old_node_id);
                }
            }
        }
    }

    /// Record that a signed announce was seen from a peer, refreshing its
    /// liveness clock and serving set.
    pub fn record_announce(
        &mut self,
        peer_id: PeerId,
        node_id: &str,
        addresses: Vec<Multiaddr>,
        capabilities: Vec<String>,
        serving: HashSet<TaskHash>,
        now_ms: i64,
    ) {
        self.upsert(PeerInfo {
            peer_id,
            node_id: Some(node_id.to_string()),
            addresses,
            last_seen_ms: now_ms,
            capabilities,
            serving,
        });
    }

    pub fn touch(&mut self, peer_id: &PeerId, now_ms: i64) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.last_seen_ms = now_ms;
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        let info = self.peers.remove(peer_id)?;
        if let Some(node_id) = &info.node_id {
            self.by_node_id.remove(node_id);
        }
        Some(info)
    }

    /// Drop peers not seen within the expiry window.
    pub fn prune_expired(&mut self, now_ms: i64) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, info)| now_ms - info.last_seen_ms > constants::PEER_EXPIRY_MS)
            .map(|(id, _)| *id)
            .collect();
        for peer_id in &expired {
            self.remove(peer_id);
        }
        expired
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn by_node_id(&self, node_id: &str) -> Option<&PeerInfo> {
        self.by_node_id.get(node_id).and_then(|id| self.peers.get(id))
    }

    /// Peers advertising the payload of a task.
    pub fn serving(&self, task_hash: &str) -> Vec<&PeerInfo> {
        self.peers
            .values()
            .filter(|p| p.serving.contains(task_hash))
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.by_node_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerInfo)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Message deduplication cache. Bounded FIFO eviction.
#[derive(Debug)]
pub struct DedupCache {
    /// Ordered from oldest to newest.
    entries: Vec<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            set: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns true if the message ID was already seen.
    pub fn check_and_insert(&mut self, message_id: &str) -> bool {
        if self.set.contains(message_id) {
            return true;
        }
        if self.capacity == 0 {
            return false;
        }
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.first().cloned() {
                self.entries.remove(0);
                self.set.remove(&oldest);
            }
        }
        self.set.insert(message_id.to_string());
        self.entries.push(message_id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Configuration for the transport layer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<Multiaddr>,
    pub enable_mdns: bool,
    pub dedup_capacity: usize,
    pub announce_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr")],
            bootstrap_peers: vec![],
            enable_mdns: true,
            dedup_capacity: constants::DEDUP_CACHE_SIZE,
            announce_interval: Duration::from_millis(constants::PEER_ANNOUNCE_INTERVAL_MS as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: Option<&str>, last_seen_ms: i64, serving: &[&str]) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::random(),
            node_id: node_id.map(str::to_string),
            addresses: vec![],
            last_seen_ms,
            capabilities: vec!["execute".into()],
            serving: serving.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn directory_indexes_by_node_id() {
        let mut dir = PeerDirectory::new();
        let info = peer(Some("node-a"), 1_000, &[]);
        let peer_id = info.peer_id;
        dir.upsert(info);

        assert_eq!(dir.by_node_id("node-a").unwrap().peer_id, peer_id);
        assert!(dir.by_node_id("node-b").is_none());
    }

    #[test]
    fn directory_prunes_silent_peers() {
        let mut dir = PeerDirectory::new();
        dir.upsert(peer(Some("old"), 0, &[]));
        dir.upsert(peer(Some("fresh"), 29 * 60 * 1000, &[]));

        let pruned = dir.prune_expired(31 * 60 * 1000);
        assert_eq!(pruned.len(), 1);
        assert!(dir.by_node_id("old").is_none());
        assert!(dir.by_node_id("fresh").is_some());
    }

    #[test]
    fn serving_lookup() {
        let mut dir = PeerDirectory::new();
        dir.upsert(peer(Some("a"), 1_000, &["task-1", "task-2"]));
        dir.upsert(peer(Some("b"), 1_000, &["task-2"]));
        dir.upsert(peer(Some("c"), 1_000, &[]));

        assert_eq!(dir.serving("task-1").len(), 1);
        assert_eq!(dir.serving("task-2").len(), 2);
        assert!(dir.serving("task-3").is_empty());
    }

    #[test]
    fn announce_refreshes_liveness() {
        let mut dir = PeerDirectory::new();
        let info = peer(Some("a"), 1_000, &[]);
        let peer_id = info.peer_id;
        dir.upsert(info);

        dir.record_announce(peer_id, "a", vec![], vec![], HashSet::new(), 5_000);
        assert_eq!(dir.get(&peer_id).unwrap().last_seen_ms, 5_000);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn dedup_cache_evicts_oldest() {
        let mut cache = DedupCache::new(3);
        assert!(!cache.check_and_insert("a"));
        assert!(cache.check_and_insert("a"));
        assert!(!cache.check_and_insert("b"));
        assert!(!cache.check_and_insert("c"));
        assert!(!cache.check_and_insert("d")); // evicts "a"
        assert!(!cache.check_and_insert("a"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn dedup_cache_capacity_zero() {
        let mut cache = DedupCache::new(0);
        assert!(!cache.check_and_insert("a"));
        assert!(!cache.check_and_insert("a"));
    }
}
