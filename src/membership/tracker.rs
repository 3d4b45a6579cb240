use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::types::NodeId;

/// Locally known live node set of one map, keyed by join timestamp.
///
/// Fed by the channel's membership callbacks. The whole map lives behind a
/// single mutex: backup-set computations must observe the member list at a
/// consistent instant, never mid-update, so readers take the same lock as
/// the add/remove path. Critical sections are short and never held across
/// an await.
///
/// The local node is excluded by construction; it is always implicitly
/// "self" and never its own backup.
pub struct MembershipTracker {
    local: NodeId,
    members: Mutex<HashMap<NodeId, u64>>,
}

impl MembershipTracker {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Record a joining node. Returns false (and logs) when the node was
    /// already known or is the local node, so callers can skip the repair
    /// pass for duplicate events.
    pub fn member_added(&self, node: &NodeId) -> bool {
        if *node == self.local {
            return false;
        }
        let mut members = self.members.lock();
        if members.contains_key(node) {
            tracing::warn!("Ignoring duplicate join for already-known member {}", node);
            return false;
        }
        members.insert(node.clone(), now_ms());
        tracing::info!("Member {} joined, {} known member(s)", node, members.len());
        true
    }

    /// Record a departed node. Removing an unknown node is a logged no-op.
    pub fn member_removed(&self, node: &NodeId) -> bool {
        let mut members = self.members.lock();
        if members.remove(node).is_none() {
            tracing::warn!("Ignoring departure of unknown member {}", node);
            return false;
        }
        tracing::info!("Member {} left, {} known member(s)", node, members.len());
        true
    }

    /// Snapshot of the live node set, oldest join first, self excluded.
    ///
    /// The order doubles as backup promotion priority, so it must be
    /// stable between calls on the same node; ties on the millisecond
    /// timestamp fall back to the node id.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let members = self.members.lock();
        let mut nodes: Vec<(NodeId, u64)> = members
            .iter()
            .map(|(id, joined)| (id.clone(), *joined))
            .collect();
        nodes.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        nodes.into_iter().map(|(id, _)| id).collect()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.lock().contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Drop all membership state. Part of map shutdown.
    pub fn clear(&self) {
        self.members.lock().clear();
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
