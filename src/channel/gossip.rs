use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::info;

use crate::map::protocol::{ENDPOINT_MESSAGE, ENDPOINT_STATE, MapMessage, StateResponse};

use super::group::{GroupChannel, GroupListener};
use super::types::{FaultCause, GossipMessage, Member, NodeId, NodeState, SendError, SendFault};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_millis(500);
const SEND_ATTEMPTS: usize = 3;

/// Production group channel: SWIM-like UDP gossip for membership and
/// failure detection, HTTP for replication-message delivery.
///
/// Health transitions fire the registered listeners' membership
/// callbacks: a node discovered alive is announced as added, a node
/// declared dead as removed, a resurrected node as added again. Message
/// sends classify per-target outcomes: an HTTP connect/timeout error is
/// a transport fault, an error status from a reachable peer is a
/// remote-processing fault.
pub struct GossipChannel {
    pub local: Member,
    pub members: Arc<DashMap<NodeId, Member>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    listeners: Arc<DashMap<String, Arc<dyn GroupListener>>>,
    http: reqwest::Client,
}

impl GossipChannel {
    /// Bind the gossip socket and announce this node to the seed nodes.
    /// `http_addr` is where peers deliver replication messages; it is
    /// carried in every gossip exchange.
    pub async fn new(
        bind_addr: std::net::SocketAddr,
        http_addr: std::net::SocketAddr,
        seed_nodes: Vec<std::net::SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let bound_addr = socket.local_addr()?;
        let local = Member {
            id: NodeId::new(),
            gossip_addr: bound_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local.id.clone(), local.clone());

        if !seed_nodes.is_empty() {
            info!("Joining group via {} seed node(s)", seed_nodes.len());
            let join = GossipMessage::Join {
                member: local.clone(),
            };
            let encoded = bincode::serialize(&join)?;
            for seed in &seed_nodes {
                socket.send_to(&encoded, seed).await?;
                info!("Sent join request to {}", seed);
            }
        }

        Ok(Arc::new(Self {
            local,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            listeners: Arc::new(DashMap::new()),
            http: reqwest::Client::new(),
        }))
    }

    /// Spawn the gossip, receive and failure-detection loops.
    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting group channel on {}", self.local.gossip_addr);

        let channel = self.clone();
        tokio::spawn(async move {
            channel.gossip_loop().await;
        });

        let channel = self.clone();
        tokio::spawn(async move {
            channel.receive_loop().await;
        });

        let channel = self.clone();
        tokio::spawn(async move {
            channel.failure_detection_loop().await;
        });
    }

    pub fn get_member(&self, node: &NodeId) -> Option<Member> {
        self.members.get(node).map(|member| member.value().clone())
    }

    pub fn alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Listener registered for `map_id`, used by the HTTP delivery layer.
    pub fn listener(&self, map_id: &str) -> Option<Arc<dyn GroupListener>> {
        self.listeners
            .get(map_id)
            .map(|listener| listener.value().clone())
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let peers: Vec<Member> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local.id && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if peers.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = &peers[rand::thread_rng().gen_range(0..peers.len())];

            let mut probe = self.local.clone();
            probe.incarnation = *self.incarnation.read().await;
            let ping = GossipMessage::Ping { from: probe };

            match bincode::serialize(&ping) {
                Ok(encoded) => {
                    if let Err(error) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to ping {}: {}", target.id, error);
                    }
                }
                Err(error) => tracing::error!("Failed to encode ping: {}", error),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(message) => {
                        if let Err(error) = self.handle_message(message).await {
                            tracing::error!("Error handling gossip from {}: {}", src, error);
                        }
                    }
                    Err(error) => {
                        tracing::warn!("Undecodable gossip packet from {}: {}", src, error);
                    }
                },
                Err(error) => {
                    tracing::error!("Failed to receive gossip packet: {}", error);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: GossipMessage) -> Result<()> {
        match message {
            GossipMessage::Ping { from } => self.handle_ping(from).await?,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => self.handle_ack(from, incarnation, members).await,
            GossipMessage::Join { member } => self.handle_join(member).await,
            GossipMessage::Suspect { node, incarnation } => {
                self.handle_suspect(node, incarnation).await
            }
            GossipMessage::Alive { node, incarnation } => {
                self.handle_alive(node, incarnation).await
            }
        }
        Ok(())
    }

    async fn handle_ping(&self, mut from: Member) -> Result<()> {
        tracing::debug!("Ping from {}", from.id);
        let reply_to = from.gossip_addr;
        from.last_seen = Some(Instant::now());
        self.merge_member(from).await;

        let all_members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let reply = GossipMessage::Ack {
            from: self.local.id.clone(),
            incarnation: *self.incarnation.read().await,
            members: all_members,
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, reply_to).await?;
        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Member>) {
        tracing::debug!(
            "Ack from {} (inc={}) carrying {} member(s)",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member).await;
        }
    }

    async fn handle_join(&self, mut member: Member) {
        info!("Node {} joining group at {}", member.id, member.gossip_addr);
        member.last_seen = Some(Instant::now());
        member.state = NodeState::Alive;
        self.merge_member(member).await;
    }

    /// Fold a remotely learned member record into the local view,
    /// announcing discoveries, deaths and resurrections to listeners.
    async fn merge_member(&self, new_member: Member) {
        if new_member.id == self.local.id {
            return;
        }

        enum Transition {
            None,
            Added(NodeId),
            Removed(NodeId),
        }

        let transition = match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    let was_dead = existing.state == NodeState::Dead;
                    let now_dead = new_member.state == NodeState::Dead;
                    existing.state = new_member.state.clone();
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                    if !was_dead && now_dead {
                        Transition::Removed(new_member.id.clone())
                    } else if was_dead && !now_dead {
                        Transition::Added(new_member.id.clone())
                    } else {
                        Transition::None
                    }
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    info!("{} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    Transition::None
                } else {
                    Transition::None
                }
            }
            None => {
                info!(
                    "Discovered new member {} at {}",
                    new_member.id, new_member.gossip_addr
                );
                let id = new_member.id.clone();
                let alive = new_member.state == NodeState::Alive;
                let mut discovered = new_member;
                discovered.last_seen = Some(Instant::now());
                self.members.insert(id.clone(), discovered);
                if alive {
                    Transition::Added(id)
                } else {
                    Transition::None
                }
            }
        };

        match transition {
            Transition::Added(node) => self.notify_added(&node).await,
            Transition::Removed(node) => self.notify_removed(&node).await,
            Transition::None => {}
        }
    }

    async fn handle_suspect(&self, node: NodeId, incarnation: u64) {
        if node == self.local.id {
            // Somebody thinks we are gone; bump incarnation and refute.
            let refuted = {
                let mut inc = self.incarnation.write().await;
                *inc += 1;
                *inc
            };
            info!("Refuting suspicion about self (inc={})", refuted);
            if let Some(mut me) = self.members.get_mut(&self.local.id) {
                me.incarnation = refuted;
                me.state = NodeState::Alive;
            }
            self.broadcast(GossipMessage::Alive {
                node: self.local.id.clone(),
                incarnation: refuted,
            })
            .await;
            return;
        }

        match self.members.get_mut(&node) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    info!("Node {} suspected", node);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = existing.incarnation.max(incarnation);
                }
            }
            None => tracing::debug!("Suspicion about unknown node {}", node),
        }
    }

    async fn handle_alive(&self, node: NodeId, incarnation: u64) {
        let resurrected = match self.members.get_mut(&node) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    let was_dead = existing.state == NodeState::Dead;
                    info!("Node {} is alive (inc={})", node, incarnation);
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    was_dead
                } else {
                    false
                }
            }
            None => {
                tracing::debug!("Alive report for unknown node {}", node);
                false
            }
        };

        if resurrected {
            self.notify_added(&node).await;
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspects = Vec::new();
            let mut dead = Vec::new();

            for mut entry in self.members.iter_mut() {
                if entry.id == self.local.id {
                    continue;
                }
                let Some(last_seen) = entry.last_seen else {
                    entry.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match entry.state {
                    NodeState::Alive => {
                        if elapsed > SUSPECT_TIMEOUT {
                            tracing::warn!(
                                "Node {} suspected (no contact for {:?})",
                                entry.id,
                                elapsed
                            );
                            entry.state = NodeState::Suspect;
                            suspects.push(GossipMessage::Suspect {
                                node: entry.id.clone(),
                                incarnation: entry.incarnation,
                            });
                        }
                    }
                    NodeState::Suspect => {
                        if elapsed > DEAD_TIMEOUT {
                            info!("Node {} declared dead (no contact for {:?})", entry.id, elapsed);
                            entry.state = NodeState::Dead;
                            dead.push(entry.id.clone());
                        }
                    }
                    NodeState::Dead => {}
                }
            }

            for message in suspects {
                self.broadcast(message).await;
            }
            for node in dead {
                self.notify_removed(&node).await;
            }
        }
    }

    async fn broadcast(&self, message: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&message) else {
            tracing::error!("Failed to encode gossip broadcast");
            return;
        };
        let peers: Vec<Member> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for peer in peers {
            if let Err(error) = self.socket.send_to(&encoded, peer.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", peer.id, error);
            }
        }
    }

    async fn notify_added(&self, node: &NodeId) {
        let listeners: Vec<Arc<dyn GroupListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            listener.member_added(node).await;
        }
    }

    async fn notify_removed(&self, node: &NodeId) {
        let listeners: Vec<Arc<dyn GroupListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            listener.member_removed(node).await;
        }
    }

    /// POST with bounded retries; only transport-level failures retry,
    /// an error status from the peer is returned as-is.
    async fn post_message(
        &self,
        url: String,
        message: &MapMessage,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            let response = self
                .http
                .post(url.clone())
                .json(message)
                .timeout(SEND_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(error) => {
                    attempt += 1;
                    if attempt == SEND_ATTEMPTS {
                        return Err(error);
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
    }
}

#[async_trait]
impl GroupChannel for GossipChannel {
    fn local_node(&self) -> NodeId {
        self.local.id.clone()
    }

    fn live_members(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    async fn send(&self, targets: &[NodeId], message: MapMessage) -> Result<(), SendError> {
        if targets.is_empty() {
            return Ok(());
        }

        let mut faults = Vec::new();
        for target in targets {
            let Some(member) = self.get_member(target) else {
                faults.push(SendFault {
                    node: target.clone(),
                    cause: FaultCause::Transport("unknown member".to_string()),
                });
                continue;
            };
            if member.state == NodeState::Dead {
                faults.push(SendFault {
                    node: target.clone(),
                    cause: FaultCause::Transport("member is dead".to_string()),
                });
                continue;
            }

            let url = format!("http://{}{}", member.http_addr, ENDPOINT_MESSAGE);
            match self.post_message(url, &message).await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    // The peer answered, so it is alive; its own handling
                    // of the message failed.
                    faults.push(SendFault {
                        node: target.clone(),
                        cause: FaultCause::Remote(format!(
                            "peer replied {}",
                            response.status()
                        )),
                    });
                }
                Err(error) => {
                    faults.push(SendFault {
                        node: target.clone(),
                        cause: FaultCause::Transport(error.to_string()),
                    });
                }
            }
        }

        if faults.is_empty() {
            Ok(())
        } else {
            Err(SendError::Faulty { faults })
        }
    }

    async fn fetch_state(&self, from: &NodeId, map_id: &str) -> Result<Vec<MapMessage>> {
        let member = self
            .get_member(from)
            .ok_or_else(|| anyhow::anyhow!("unknown member {}", from))?;

        let url = format!("http://{}{}/{}", member.http_addr, ENDPOINT_STATE, map_id);
        let mut delay_ms = 150u64;

        for attempt in 0..SEND_ATTEMPTS {
            let response = self
                .http
                .get(url.clone())
                .timeout(SEND_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let state: StateResponse = resp.json().await?;
                    return Ok(state.messages);
                }
                Ok(resp) => {
                    return Err(anyhow::anyhow!("state request failed: {}", resp.status()));
                }
                Err(error) => {
                    if attempt + 1 == SEND_ATTEMPTS {
                        return Err(anyhow::anyhow!(error));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("state request attempts exhausted"))
    }

    fn register(&self, map_id: &str, listener: Arc<dyn GroupListener>) {
        self.listeners.insert(map_id.to_string(), listener);
    }

    fn unregister(&self, map_id: &str) {
        self.listeners.remove(map_id);
    }
}
