//! Replication Wire Protocol
//!
//! Defines the replication message exchanged between map instances and the
//! DTOs of the HTTP surface.
//!
//! Keys cross the wire as strings and values as serialized JSON, so the
//! channel layer stays independent of the map's key/value types.

use serde::{Deserialize, Serialize};

use crate::channel::types::NodeId;

// --- API Endpoints ---

/// Public endpoint for client write requests.
pub const ENDPOINT_PUT: &str = "/put";
/// Public endpoint for client read requests.
pub const ENDPOINT_GET: &str = "/get";
/// Public endpoint for client delete requests.
pub const ENDPOINT_REMOVE: &str = "/remove";
/// Public endpoint reporting node and cluster state.
pub const ENDPOINT_STATUS: &str = "/status";
/// Internal endpoint replication messages are delivered to.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";
/// Internal endpoint serving full-state snapshots to joining nodes.
pub const ENDPOINT_STATE: &str = "/internal/state";

// --- Replication Messages ---

/// Discriminates what a `MapMessage` means to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Bulk snapshot entry sent to a newly joined node.
    FullStateTransfer,
    /// Single key/value change pushed from the primary to its backups.
    IncrementalCopy,
    /// Routing update: who is primary, who backs the key up. Carries no
    /// value; the receiver is expected to already hold one if it needs it.
    OwnershipNotify,
    /// Deletion issued by the primary.
    Remove,
}

/// One replication message.
///
/// `sender` is the node authoritative for the key at build time (for state
/// transfer entries that is the recorded primary, which may differ from the
/// node serving the snapshot). `targets` is the backup set the sender
/// selected, in promotion-priority order; receivers adopt it verbatim.
/// `value_set` distinguishes "no value attached" from "value is JSON null".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMessage {
    pub map_id: String,
    pub kind: MessageKind,
    pub key: String,
    pub value_json: Option<String>,
    pub value_set: bool,
    pub sender: NodeId,
    pub targets: Vec<NodeId>,
}

// --- HTTP Data Transfer Objects ---

/// Client write request.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    /// The serialized JSON string of the value.
    pub value_json: String,
}

/// Acknowledgment for write and delete operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    /// Human-readable failure cause, if any.
    pub error: Option<String>,
}

/// Response for read requests. `None` means the key is not held locally.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value_json: Option<String>,
}

/// Acknowledgment for inbound replication messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageAck {
    pub success: bool,
}

/// Full-state snapshot of one map, served to joining nodes.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub map_id: String,
    pub messages: Vec<MapMessage>,
}

/// Node status summary.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: NodeId,
    pub live_members: Vec<NodeId>,
    pub entries: usize,
}
