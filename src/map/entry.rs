use crate::channel::types::NodeId;
use crate::membership::tracker::now_ms;

/// What this node is to a key. Exactly one role at a time; the old
/// primary/backup/proxy/copy flag combination is unrepresentable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative owner; local writes are accepted.
    Primary,
    /// Replica named in the primary's backup set.
    Backup,
    /// Cached, non-authoritative value. Promotion-eligible only if this
    /// node also appears in the entry's backup list.
    Copy,
    /// Placeholder with no local value; ownership lives elsewhere.
    Proxy,
}

impl Role {
    /// Whether an ownerless entry in this role may take the key over.
    pub fn promotable(&self) -> bool {
        matches!(self, Role::Backup | Role::Copy)
    }
}

/// Per-key replication state.
///
/// `backups` is ordered: index 0 is first in line for promotion when the
/// primary disappears. It never contains the primary, and departed nodes
/// are pruned from it on every membership change.
#[derive(Debug, Clone)]
pub struct MapEntry<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub role: Role,
    pub primary: Option<NodeId>,
    pub backups: Vec<NodeId>,
    pub last_accessed: u64,
}

impl<K, V> MapEntry<K, V> {
    /// Entry for a locally written key: this node is primary.
    pub fn primary(key: K, value: V, local: NodeId, backups: Vec<NodeId>) -> Self {
        Self {
            key,
            value: Some(value),
            role: Role::Primary,
            primary: Some(local),
            backups,
            last_accessed: now_ms(),
        }
    }

    /// Entry for a replicated value received from `primary`.
    pub fn replica(key: K, value: V, role: Role, primary: NodeId, backups: Vec<NodeId>) -> Self {
        Self {
            key,
            value: Some(value),
            role,
            primary: Some(primary),
            backups,
            last_accessed: now_ms(),
        }
    }

    /// Value-less placeholder created by an ownership notification for a
    /// key this node has never seen.
    pub fn proxy(key: K, primary: NodeId, backups: Vec<NodeId>) -> Self {
        Self {
            key,
            value: None,
            role: Role::Proxy,
            primary: Some(primary),
            backups,
            last_accessed: now_ms(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// First node in line for promotion, if any.
    pub fn first_backup(&self) -> Option<&NodeId> {
        self.backups.first()
    }

    pub fn touch(&mut self) {
        self.last_accessed = now_ms();
    }
}
