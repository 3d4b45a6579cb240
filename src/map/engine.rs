//! Replication Protocol Engine
//!
//! Builds replication messages and pushes them through the group channel.
//! The engine's one correctness subtlety is fault classification on a
//! partially failed send: a target whose own message handling threw is
//! still alive and stays in the backup set, while an unreachable target is
//! dropped. Misreading a transient remote error as node death churns the
//! backup set for nothing; misreading death as a remote error makes
//! replication to a corpse look successful.

use std::sync::Arc;

use crate::channel::group::GroupChannel;
use crate::channel::types::{NodeId, SendError};

use super::protocol::{MapMessage, MessageKind};

/// Which message kinds this engine stamps on outbound traffic. A
/// configuration value, not a type hierarchy: an all-to-all map replicates
/// with `IncrementalCopy` and transfers state with `FullStateTransfer`;
/// a variant flavor only needs different constants here.
#[derive(Debug, Clone, Copy)]
pub struct MessageKinds {
    pub state: MessageKind,
    pub replicate: MessageKind,
}

impl Default for MessageKinds {
    fn default() -> Self {
        Self {
            state: MessageKind::FullStateTransfer,
            replicate: MessageKind::IncrementalCopy,
        }
    }
}

/// Errors surfaced by the map and its engine.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Every replication target failed; the local write is committed but
    /// not replicated anywhere.
    #[error("failed to replicate key '{key}' to any target")]
    ReplicationFailed {
        key: String,
        #[source]
        source: SendError,
    },

    /// Single-writer rule: the key is owned by another node.
    #[error("key '{key}' is owned by node {owner}; local write rejected")]
    NotOwner { key: String, owner: NodeId },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound message that cannot be applied (bad key, missing value).
    #[error("malformed replication message: {0}")]
    Malformed(String),
}

pub struct ReplicationEngine {
    map_id: String,
    kinds: MessageKinds,
    channel: Arc<dyn GroupChannel>,
}

impl ReplicationEngine {
    pub fn new(channel: Arc<dyn GroupChannel>, map_id: &str, kinds: MessageKinds) -> Self {
        Self {
            map_id: map_id.to_string(),
            kinds,
            channel,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.channel.local_node()
    }

    /// Replicate one key/value change to `targets` and report which of
    /// them can still be considered backups.
    ///
    /// - Empty `targets` (single-node group): no-op, entry stays local.
    /// - Clean send: the full target set is returned.
    /// - Partial failure: remote-processing faults keep their target in
    ///   the set; transport faults drop theirs. An emptied set surfaces
    ///   the original failure as `ReplicationFailed`, a shrunk one is a
    ///   warn-logged partial success.
    pub async fn publish(
        &self,
        key: &str,
        value_json: &str,
        targets: &[NodeId],
    ) -> Result<Vec<NodeId>, MapError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let message = MapMessage {
            map_id: self.map_id.clone(),
            kind: self.kinds.replicate,
            key: key.to_string(),
            value_json: Some(value_json.to_string()),
            value_set: true,
            sender: self.channel.local_node(),
            targets: targets.to_vec(),
        };

        match self.channel.send(targets, message).await {
            Ok(()) => Ok(targets.to_vec()),
            Err(error) => self.classify(key, targets, error),
        }
    }

    /// Propagate a deletion. Same fault classification as `publish`: the
    /// local removal is already done, but the caller is told when nobody
    /// heard about it.
    pub async fn publish_remove(&self, key: &str, targets: &[NodeId]) -> Result<Vec<NodeId>, MapError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let message = MapMessage {
            map_id: self.map_id.clone(),
            kind: MessageKind::Remove,
            key: key.to_string(),
            value_json: None,
            value_set: false,
            sender: self.channel.local_node(),
            targets: targets.to_vec(),
        };

        match self.channel.send(targets, message).await {
            Ok(()) => Ok(targets.to_vec()),
            Err(error) => self.classify(key, targets, error),
        }
    }

    /// Tell `targets` who owns `key` and who backs it up. No value
    /// payload; receivers already hold one if they need it. Receivers
    /// apply this idempotently.
    pub async fn send_ownership(&self, key: &str, targets: &[NodeId]) -> Result<(), SendError> {
        if targets.is_empty() {
            return Ok(());
        }

        let message = MapMessage {
            map_id: self.map_id.clone(),
            kind: MessageKind::OwnershipNotify,
            key: key.to_string(),
            value_json: None,
            value_set: false,
            sender: self.channel.local_node(),
            targets: targets.to_vec(),
        };

        self.channel.send(targets, message).await
    }

    /// Build one state-transfer message for a snapshot. `primary` is the
    /// recorded owner of the entry, which is not necessarily the node
    /// serving the snapshot.
    pub fn state_message(
        &self,
        key: &str,
        value_json: String,
        primary: NodeId,
        targets: Vec<NodeId>,
    ) -> MapMessage {
        MapMessage {
            map_id: self.map_id.clone(),
            kind: self.kinds.state,
            key: key.to_string(),
            value_json: Some(value_json),
            value_set: true,
            sender: primary,
            targets,
        }
    }

    fn classify(
        &self,
        key: &str,
        targets: &[NodeId],
        error: SendError,
    ) -> Result<Vec<NodeId>, MapError> {
        let (departed, fault_count) = match &error {
            SendError::Faulty { faults } if !faults.is_empty() => {
                let departed: Vec<NodeId> = faults
                    .iter()
                    .filter(|fault| fault.cause.is_transport())
                    .map(|fault| fault.node.clone())
                    .collect();
                (departed, faults.len())
            }
            // A failure with no fault attribution cannot be repaired.
            _ => {
                return Err(MapError::ReplicationFailed {
                    key: key.to_string(),
                    source: error,
                });
            }
        };

        if departed.is_empty() {
            // Every fault was the remote peer's own processing; all
            // targets are still live replicas.
            tracing::warn!(
                "Replication of key '{}' hit remote-processing faults on {} target(s), keeping them",
                key,
                fault_count
            );
            return Ok(targets.to_vec());
        }

        let kept: Vec<NodeId> = targets
            .iter()
            .filter(|target| !departed.contains(target))
            .cloned()
            .collect();

        if kept.is_empty() {
            return Err(MapError::ReplicationFailed {
                key: key.to_string(),
                source: error,
            });
        }

        tracing::warn!(
            "Unable to replicate key '{}' completely. Reached: {:?}, dropped: {:?}",
            key,
            kept,
            departed
        );
        Ok(kept)
    }
}
