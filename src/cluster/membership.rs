//! Gossip membership service.
//!
//! Every node keeps a map of known members, pings one random alive peer per gossip
//! round and merges the member list piggybacked on the ack. Members that stay silent
//! go Alive -> Suspect -> Dead; a suspected node refutes by bumping its incarnation.

use anyhow::Result;
use dashmap::DashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{GossipMessage, Node, NodeId, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
}

impl MembershipService {
    /// Binds the gossip socket and sends a join to every seed. `http_addr` is
    /// advertised to peers as where this node serves forwarded operations.
    pub async fn new(
        gossip_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(gossip_addr).await?;
        let gossip_addr = socket.local_addr()?;

        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());
            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        info!("Starting membership service on {}", self.local_node.gossip_addr);

        let service = self.clone();
        tokio::spawn(async move { service.gossip_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.receive_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.failure_detection_loop().await });
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    /// Alive members other than this node.
    pub fn peers(&self) -> Vec<Node> {
        self.get_alive_members()
            .into_iter()
            .filter(|node| node.id != self.local_node.id)
            .collect()
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let peers = self.peers();
            if peers.is_empty() {
                continue;
            }
            let target = &peers[rand::thread_rng().gen_range(0..peers.len())];

            let mut from = self.local_node.clone();
            from.incarnation = *self.incarnation.read().await;

            match bincode::serialize(&GossipMessage::Ping { from }) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to deserialize gossip from {}: {}", src, e),
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from } => self.handle_ping(from, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await;
                Ok(())
            }
            GossipMessage::Join { node } => {
                self.handle_join(node);
                Ok(())
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
                Ok(())
            }
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: Node, src: SocketAddr) -> Result<()> {
        let from_id = from.id.clone();
        self.merge_member(from);
        if let Some(mut member) = self.members.get_mut(&from_id) {
            member.last_seen = Some(Instant::now());
        }

        let members: Vec<Node> = self.members.iter().map(|e| e.value().clone()).collect();
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: *self.incarnation.read().await,
            members,
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;
        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
                member.state = NodeState::Alive;
            }
        }

        for member in members {
            if member.id == self.local_node.id {
                if member.state == NodeState::Suspect {
                    self.refute(member.incarnation).await;
                }
                continue;
            }
            self.merge_member(member);
        }
    }

    fn merge_member(&self, incoming: Node) {
        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                if incoming.incarnation > existing.incarnation {
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.http_addr = incoming.http_addr;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    info!("{} refuted suspicion", incoming.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if incoming.state == NodeState::Dead {
                    return;
                }
                info!(
                    "Discovered member {} (gossip {}, http {})",
                    incoming.id, incoming.gossip_addr, incoming.http_addr
                );
                let mut node = incoming;
                node.last_seen = Some(Instant::now());
                self.members.insert(node.id.clone(), node);
            }
        }
    }

    fn handle_join(&self, mut node: Node) {
        info!("Node {} joining cluster at {}", node.id, node.gossip_addr);
        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());
        self.members.insert(node.id.clone(), node);
        info!("Cluster size now: {}", self.members.len());
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            self.refute(incarnation).await;
            return;
        }
        if let Some(mut existing) = self.members.get_mut(&node_id)
            && incarnation >= existing.incarnation
            && existing.state == NodeState::Alive
        {
            info!("Node {} suspected", existing.id);
            existing.state = NodeState::Suspect;
            existing.incarnation = incarnation;
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        if let Some(mut existing) = self.members.get_mut(&node_id)
            && (incarnation > existing.incarnation
                || (incarnation == existing.incarnation && existing.state == NodeState::Suspect))
        {
            info!("Node {} is alive (inc={})", existing.id, incarnation);
            existing.state = NodeState::Alive;
            existing.incarnation = incarnation;
            existing.last_seen = Some(Instant::now());
        }
    }

    /// Outbids a suspicion about this node and tells everyone.
    async fn refute(&self, suspected_incarnation: u64) {
        let incarnation = {
            let mut inc = self.incarnation.write().await;
            if *inc <= suspected_incarnation {
                *inc = suspected_incarnation + 1;
            }
            *inc
        };
        if let Some(mut me) = self.members.get_mut(&self.local_node.id) {
            me.incarnation = incarnation;
            me.state = NodeState::Alive;
        }
        info!("Refuting suspicion with incarnation {}", incarnation);
        self.broadcast_message(GossipMessage::Alive {
            node_id: self.local_node.id.clone(),
            incarnation,
        })
        .await;
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            for msg in self.detect_failures(Instant::now()) {
                self.broadcast_message(msg).await;
            }
        }
    }

    /// Advances silent members one step towards Dead. Returns the suspicions to broadcast.
    pub(crate) fn detect_failures(&self, now: Instant) -> Vec<GossipMessage> {
        let mut messages = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_node.id {
                continue;
            }
            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                    tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                    member.state = NodeState::Suspect;
                    messages.push(GossipMessage::Suspect {
                        node_id: member.id.clone(),
                        incarnation: member.incarnation,
                    });
                }
                NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                    tracing::warn!("Node {} declared dead (no contact for {:?})", member.id, elapsed);
                    member.state = NodeState::Dead;
                }
                _ => {}
            }
        }

        messages
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        for member in self.peers() {
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}
