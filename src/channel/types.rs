use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Identity of a cluster node.
///
/// Backed by a plain string so test clusters can use readable names
/// ("n1", "n2") while production nodes use generated UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// One member of the process group.
///
/// `gossip_addr` is the UDP endpoint used for membership traffic,
/// `http_addr` the endpoint replication messages are delivered to.
/// The `incarnation` counter orders state updates about this member and
/// lets a falsely suspected node refute the accusation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Membership wire protocol, bincode-encoded over UDP.
///
/// - `Ping/Ack`: liveness probes; acks piggyback the full member list.
/// - `Join`: sent by a starting node to its seed nodes.
/// - `Suspect/Alive`: disseminate health transitions and refutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: Member,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Member>,
    },

    Join {
        member: Member,
    },

    Suspect {
        node: NodeId,
        incarnation: u64,
    },

    Alive {
        node: NodeId,
        incarnation: u64,
    },
}

/// Why a particular target could not be served during a group send.
///
/// The distinction matters: a transport fault means the node is gone (or
/// unreachable) and must be dropped from backup sets, while a remote
/// fault means the node was reached but its own handling of the message
/// failed, so it is still a live replica candidate.
#[derive(Debug, Clone)]
pub enum FaultCause {
    /// Target unreachable: connect error, timeout, node unknown.
    Transport(String),
    /// Target reachable but its message processing returned an error.
    Remote(String),
}

impl FaultCause {
    pub fn is_transport(&self) -> bool {
        matches!(self, FaultCause::Transport(_))
    }
}

impl std::fmt::Display for FaultCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCause::Transport(reason) => write!(f, "transport: {}", reason),
            FaultCause::Remote(reason) => write!(f, "remote: {}", reason),
        }
    }
}

/// A single failed target of a group send.
#[derive(Debug, Clone)]
pub struct SendFault {
    pub node: NodeId,
    pub cause: FaultCause,
}

/// Outcome of a failed group send, returned as a value rather than
/// thrown, so callers can classify per-target faults.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send failed for {} target(s)", faults.len())]
    Faulty { faults: Vec<SendFault> },

    #[error("channel error: {0}")]
    Channel(String),
}

impl SendError {
    /// Targets that failed with a transport fault, i.e. the ones a
    /// caller should treat as departed.
    pub fn transport_faults(&self) -> Vec<NodeId> {
        match self {
            SendError::Faulty { faults } => faults
                .iter()
                .filter(|fault| fault.cause.is_transport())
                .map(|fault| fault.node.clone())
                .collect(),
            SendError::Channel(_) => Vec::new(),
        }
    }
}
