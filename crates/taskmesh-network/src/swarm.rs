//! libp2p swarm event loop — GossipSub, mDNS, Identify, Kademlia, and the
//! chunk request/response protocol.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::SwarmEvent;
use libp2p::{
    gossipsub, identify, kad, mdns, noise, request_response, tcp, yamux, PeerId, StreamProtocol,
    Swarm, SwarmBuilder,
};
use libp2p::futures::StreamExt;
use libp2p::request_response::ProtocolSupport;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taskmesh_core::constants;
use taskmesh_core::message::{Envelope, MessageType, PeerAnnouncePayload};
use taskmesh_core::types::TaskHash;
use taskmesh_crypto::identity::NodeIdentity;
use taskmesh_crypto::signing::{sign_message, validate_envelope};

use crate::transport::{
    DedupCache, PeerDirectory, PeerInfo, TransportCommand, TransportConfig, TransportEvent,
    ALL_TOPICS, CHUNK_PROTOCOL, TOPIC_PEERS,
};

/// Wire form of a chunk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequestWire {
    pub task_hash: TaskHash,
    pub chunk_index: u32,
}

/// Wire form of a chunk response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkResponseWire {
    Chunk {
        task_hash: TaskHash,
        chunk_index: u32,
        data: Vec<u8>,
        total_size: u64,
    },
    NotFound {
        task_hash: TaskHash,
        chunk_index: u32,
    },
}

/// Composite network behaviour for Taskmesh.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct TaskmeshBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub identify: identify::Behaviour,
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub chunks: request_response::json::Behaviour<ChunkRequestWire, ChunkResponseWire>,
}

/// The main Taskmesh swarm that orchestrates all networking.
pub struct TaskmeshSwarm {
    swarm: Swarm<TaskmeshBehaviour>,
    identity: NodeIdentity,
    peer_directory: PeerDirectory,
    dedup_cache: DedupCache,
    /// Payloads we answer chunk requests for, keyed by task hash.
    served_payloads: HashMap<TaskHash, Vec<u8>>,
    /// Outstanding chunk requests, for correlating responses and failures.
    pending_chunks: HashMap<request_response::OutboundRequestId, (PeerId, TaskHash, usize)>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    announce_interval: tokio::time::Interval,
    prune_interval: tokio::time::Interval,
    config: TransportConfig,
}

impl TaskmeshSwarm {
    pub fn new(
        identity: NodeIdentity,
        config: TransportConfig,
    ) -> anyhow::Result<(
        Self,
        mpsc::UnboundedSender<TransportCommand>,
        mpsc::UnboundedReceiver<TransportEvent>,
    )> {
        let local_key =
            libp2p::identity::Keypair::ed25519_from_bytes(identity.signing_key().to_bytes())?;
        let local_peer_id = PeerId::from(local_key.public());

        info!(peer_id = %local_peer_id, node_id = %identity.node_id(), "Initializing Taskmesh swarm");

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .max_transmit_size(constants::MAX_PAYLOAD_SIZE)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| anyhow::anyhow!("GossipSub config error: {e}"))?;

        let mut gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(local_key.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("GossipSub init error: {e}"))?;

        for topic_name in ALL_TOPICS {
            let topic = gossipsub::IdentTopic::new(topic_name);
            gossipsub.subscribe(&topic)?;
            debug!(topic = topic_name, "Subscribed to GossipSub topic");
        }

        let mdns = if config.enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            "/taskmesh/0.1.0".to_string(),
            local_key.public(),
        ));

        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kad = kad::Behaviour::new(local_peer_id, store);
        kad.set_mode(Some(kad::Mode::Server));

        let chunks = request_response::json::Behaviour::new(
            [(StreamProtocol::new(CHUNK_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        let behaviour = TaskmeshBehaviour {
            gossipsub,
            mdns: Toggle::from(mdns),
            identify,
            kad,
            chunks,
        };

        let swarm = SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|_| Ok(behaviour))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let announce_interval = tokio::time::interval(config.announce_interval);
        let prune_interval = tokio::time::interval(Duration::from_secs(5 * 60));

        let swarm_instance = Self {
            swarm,
            identity,
            peer_directory: PeerDirectory::new(),
            dedup_cache: DedupCache::new(config.dedup_capacity),
            served_payloads: HashMap::new(),
            pending_chunks: HashMap::new(),
            event_tx,
            command_rx,
            announce_interval,
            prune_interval,
            config,
        };

        Ok((swarm_instance, command_tx, event_rx))
    }

    /// Start listening on configured addresses and dial bootstrap peers.
    pub fn start_listening(&mut self) -> anyhow::Result<()> {
        for addr in &self.config.listen_addrs {
            self.swarm.listen_on(addr.clone())?;
            info!(addr = %addr, "Listening on address");
        }
        for addr in self.config.bootstrap_peers.clone() {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }
        Ok(())
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Main event loop — run this to process network events.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    if let Err(e) = self.handle_swarm_event(event) {
                        warn!(error = %e, "Error handling swarm event");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    if let Err(e) = self.handle_command(cmd) {
                        warn!(error = %e, "Error handling command");
                    }
                }

                _ = self.announce_interval.tick() => {
                    if let Err(e) = self.announce_self() {
                        warn!(error = %e, "Error announcing self");
                    }
                }

                _ = self.prune_interval.tick() => {
                    self.prune_expired_peers();
                }
            }
        }
    }

    fn handle_swarm_event(
        &mut self,
        event: SwarmEvent<TaskmeshBehaviourEvent>,
    ) -> anyhow::Result<()> {
        match event {
            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Gossipsub(
                gossipsub::Event::Message { propagation_source, message, .. },
            )) => {
                self.handle_gossipsub_message(propagation_source, message);
            }

            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Mdns(mdns::Event::Discovered(
                peers,
            ))) => {
                for (peer_id, addr) in peers {
                    if peer_id == self.local_peer_id() {
                        continue;
                    }
                    debug!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                    if let Err(e) = self.swarm.dial(addr.clone()) {
                        warn!(peer = %peer_id, error = %e, "Failed to dial mDNS peer");
                    }
                    self.peer_directory.upsert(PeerInfo {
                        peer_id,
                        node_id: None,
                        addresses: vec![addr],
                        last_seen_ms: chrono::Utc::now().timestamp_millis(),
                        capabilities: vec![],
                        serving: Default::default(),
                    });
                }
            }

            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!(peer = %peer_id, "mDNS peer expired");
                    self.peer_directory.remove(&peer_id);
                }
            }

            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "Identified peer");
                for addr in &info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
                }
            }

            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Kad(
                kad::Event::OutboundQueryProgressed {
                    result:
                        kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                            key,
                            providers,
                        })),
                    ..
                },
            )) => {
                let task_hash = String::from_utf8_lossy(key.as_ref()).to_string();
                debug!(task = %task_hash, count = providers.len(), "Providers found");
                let _ = self.event_tx.send(TransportEvent::ProvidersFound {
                    task_hash,
                    providers: providers.into_iter().collect(),
                });
            }

            SwarmEvent::Behaviour(TaskmeshBehaviourEvent::Chunks(event)) => {
                self.handle_chunk_event(event);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                info!(peer = %peer_id, addr = %endpoint.get_remote_address(), "Connection established");
                let _ = self.event_tx.send(TransportEvent::PeerConnected {
                    peer_id,
                    addresses: vec![endpoint.get_remote_address().clone()],
                });
            }

            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, cause = ?cause, "Connection closed");
                if self.peer_directory.remove(&peer_id).is_some() {
                    let _ = self.event_tx.send(TransportEvent::PeerDisconnected { peer_id });
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
            }

            _ => {}
        }
        Ok(())
    }

    /// Validate, deduplicate, and surface an incoming gossip envelope.
    fn handle_gossipsub_message(&mut self, source: PeerId, message: gossipsub::Message) {
        let envelope: Envelope = match serde_json::from_slice(&message.data) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Failed to parse envelope");
                return;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();

        if now_ms - envelope.timestamp > constants::GOSSIP_MAX_AGE_MS {
            debug!(id = %envelope.id, "Rejecting stale gossip message");
            return;
        }
        if let Err(e) = validate_envelope(&envelope, now_ms) {
            debug!(id = %envelope.id, error = %e, "Rejecting invalid envelope");
            return;
        }
        if self.dedup_cache.check_and_insert(&envelope.id) {
            debug!(id = %envelope.id, "Duplicate message");
            return;
        }

        self.peer_directory.touch(&source, now_ms);
        if envelope.msg_type == MessageType::PeerAnnounce {
            self.record_peer_announce(source, &envelope, now_ms);
        }

        let _ = self.event_tx.send(TransportEvent::GossipMessage {
            topic: message.topic.to_string(),
            envelope,
            source,
        });
    }

    fn record_peer_announce(&mut self, source: PeerId, envelope: &Envelope, now_ms: i64) {
        let Ok(announce) =
            serde_json::from_value::<PeerAnnouncePayload>(envelope.payload.clone())
        else {
            warn!(from = %envelope.from, "Malformed peer announce");
            return;
        };
        let addresses = announce
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        self.peer_directory.record_announce(
            source,
            &envelope.from,
            addresses,
            announce.capabilities,
            announce.serving.into_iter().collect(),
            now_ms,
        );
    }

    fn handle_chunk_event(
        &mut self,
        event: request_response::Event<ChunkRequestWire, ChunkResponseWire>,
    ) {
        match event {
            request_response::Event::Message {
                peer,
                message: request_response::Message::Request { request, channel, .. },
                ..
            } => {
                let response = self.answer_chunk_request(&request);
                if self
                    .swarm
                    .behaviour_mut()
                    .chunks
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!(peer = %peer, "Chunk requester went away");
                }
            }

            request_response::Event::Message {
                peer,
                message: request_response::Message::Response { request_id, response },
                ..
            } => {
                let Some((_, task_hash, chunk_index)) = self.pending_chunks.remove(&request_id)
                else {
                    return;
                };
                match response {
                    ChunkResponseWire::Chunk { data, total_size, .. } => {
                        let _ = self.event_tx.send(TransportEvent::ChunkReceived {
                            peer_id: peer,
                            task_hash,
                            chunk_index,
                            data,
                            total_size: total_size as usize,
                        });
                    }
                    ChunkResponseWire::NotFound { .. } => {
                        let _ = self.event_tx.send(TransportEvent::ChunkFailed {
                            peer_id: peer,
                            task_hash,
                            chunk_index,
                        });
                    }
                }
            }

            request_response::Event::OutboundFailure { peer, request_id, error, .. } => {
                warn!(peer = %peer, error = %error, "Chunk request failed");
                if let Some((_, task_hash, chunk_index)) = self.pending_chunks.remove(&request_id)
                {
                    let _ = self.event_tx.send(TransportEvent::ChunkFailed {
                        peer_id: peer,
                        task_hash,
                        chunk_index,
                    });
                }
            }

            _ => {}
        }
    }

    fn answer_chunk_request(&self, request: &ChunkRequestWire) -> ChunkResponseWire {
        let Some(payload) = self.served_payloads.get(&request.task_hash) else {
            return ChunkResponseWire::NotFound {
                task_hash: request.task_hash.clone(),
                chunk_index: request.chunk_index,
            };
        };
        match crate::distribution::chunk_of(payload, request.chunk_index as usize) {
            Some(data) => ChunkResponseWire::Chunk {
                task_hash: request.task_hash.clone(),
                chunk_index: request.chunk_index,
                data: data.to_vec(),
                total_size: payload.len() as u64,
            },
            None => ChunkResponseWire::NotFound {
                task_hash: request.task_hash.clone(),
                chunk_index: request.chunk_index,
            },
        }
    }

    fn handle_command(&mut self, cmd: TransportCommand) -> anyhow::Result<()> {
        match cmd {
            TransportCommand::Publish { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    warn!(error = %e, "Failed to publish to GossipSub");
                }
            }
            TransportCommand::Dial { addr } => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    warn!(addr = %addr, error = %e, "Failed to dial peer");
                }
            }
            TransportCommand::Announce => {
                self.announce_self()?;
            }
            TransportCommand::StartProviding { task_hash } => {
                let key = kad::RecordKey::new(&task_hash.as_bytes());
                if let Err(e) = self.swarm.behaviour_mut().kad.start_providing(key) {
                    warn!(task = %task_hash, error = %e, "Failed to start providing");
                }
            }
            TransportCommand::FindProviders { task_hash } => {
                let key = kad::RecordKey::new(&task_hash.as_bytes());
                self.swarm.behaviour_mut().kad.get_providers(key);
            }
            TransportCommand::RequestChunk { peer_id, task_hash, chunk_index } => {
                let request = ChunkRequestWire {
                    task_hash: task_hash.clone(),
                    chunk_index: chunk_index as u32,
                };
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .chunks
                    .send_request(&peer_id, request);
                self.pending_chunks
                    .insert(request_id, (peer_id, task_hash, chunk_index));
            }
            TransportCommand::ServePayload { task_hash, payload } => {
                debug!(task = %task_hash, size = payload.len(), "Serving payload");
                self.served_payloads.insert(task_hash, payload);
            }
            TransportCommand::StopServing { task_hash } => {
                self.served_payloads.remove(&task_hash);
                let key = kad::RecordKey::new(&task_hash.as_bytes());
                self.swarm.behaviour_mut().kad.stop_providing(&key);
            }
        }
        Ok(())
    }

    /// Announce ourselves on the peers topic, including the payloads we
    /// currently serve.
    fn announce_self(&mut self) -> anyhow::Result<()> {
        let addrs: Vec<String> = self.swarm.listeners().map(|a| a.to_string()).collect();
        let mut serving: Vec<TaskHash> = self.served_payloads.keys().cloned().collect();
        serving.sort();

        let payload = serde_json::to_value(&PeerAnnouncePayload {
            addresses: addrs,
            capabilities: vec!["execute".into(), "serve".into()],
            version: 0,
            serving,
        })?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let envelope = sign_message(&self.identity, MessageType::PeerAnnounce, payload, now_ms);
        let data = serde_json::to_vec(&envelope)?;
        let topic = gossipsub::IdentTopic::new(TOPIC_PEERS);

        if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
            warn!(error = %e, "Failed to publish peer announcement");
        } else {
            debug!("Published peer announcement");
        }
        Ok(())
    }

    fn prune_expired_peers(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        for peer_id in self.peer_directory.prune_expired(now_ms) {
            debug!(peer = %peer_id, "Pruned expired peer");
            let _ = self.event_tx.send(TransportEvent::PeerDisconnected { peer_id });
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peer_directory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::chunk_of;

    fn test_config() -> TransportConfig {
        TransportConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            bootstrap_peers: vec![],
            enable_mdns: false, // avoid port conflicts in tests
            dedup_capacity: 1000,
            announce_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn swarm_creation_succeeds() {
        let identity = NodeIdentity::generate();
        assert!(TaskmeshSwarm::new(identity, test_config()).is_ok());
    }

    #[tokio::test]
    async fn swarm_listening_succeeds() {
        let identity = NodeIdentity::generate();
        let (mut swarm, _, _) = TaskmeshSwarm::new(identity, test_config()).unwrap();
        assert!(swarm.start_listening().is_ok());
    }

    #[tokio::test]
    async fn two_swarms_get_different_peer_ids() {
        let (s1, _, _) = TaskmeshSwarm::new(NodeIdentity::generate(), test_config()).unwrap();
        let (s2, _, _) = TaskmeshSwarm::new(NodeIdentity::generate(), test_config()).unwrap();
        assert_ne!(s1.local_peer_id(), s2.local_peer_id());
    }

    #[tokio::test]
    async fn served_payload_answers_chunk_requests() {
        let (mut swarm, _, _) = TaskmeshSwarm::new(NodeIdentity::generate(), test_config()).unwrap();
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        swarm
            .handle_command(TransportCommand::ServePayload {
                task_hash: "task-1".into(),
                payload: payload.clone(),
            })
            .unwrap();

        let response = swarm.answer_chunk_request(&ChunkRequestWire {
            task_hash: "task-1".into(),
            chunk_index: 1,
        });
        match response {
            ChunkResponseWire::Chunk { data, total_size, .. } => {
                assert_eq!(data, chunk_of(&payload, 1).unwrap());
                assert_eq!(total_size, payload.len() as u64);
            }
            ChunkResponseWire::NotFound { .. } => panic!("expected chunk"),
        }
    }

    #[tokio::test]
    async fn unknown_payload_chunk_request_is_not_found() {
        let (swarm, _, _) = TaskmeshSwarm::new(NodeIdentity::generate(), test_config()).unwrap();
        let response = swarm.answer_chunk_request(&ChunkRequestWire {
            task_hash: "missing".into(),
            chunk_index: 0,
        });
        assert!(matches!(response, ChunkResponseWire::NotFound { .. }));
    }

    #[tokio::test]
    async fn out_of_range_chunk_request_is_not_found() {
        let (mut swarm, _, _) = TaskmeshSwarm::new(NodeIdentity::generate(), test_config()).unwrap();
        swarm
            .handle_command(TransportCommand::ServePayload {
                task_hash: "task-1".into(),
                payload: vec![0u8; 10],
            })
            .unwrap();
        let response = swarm.answer_chunk_request(&ChunkRequestWire {
            task_hash: "task-1".into(),
            chunk_index: 99,
        });
        assert!(matches!(response, ChunkResponseWire::NotFound { .. }));
    }
}
