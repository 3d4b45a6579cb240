use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use crate::channel::group::{GroupChannel, GroupListener};
use crate::channel::types::NodeId;
use crate::membership::tracker::MembershipTracker;

use super::engine::{MapError, MessageKinds, ReplicationEngine};
use super::entry::{MapEntry, Role};
use super::protocol::{MapMessage, MessageKind};

type PromotionHook<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// Clustered in-memory map replicating every entry to the rest of the
/// group. Exactly one node owns a key at a time; the owner pushes copies
/// to the other live members, which double as its promotion-ordered
/// backup set.
///
/// Writes to a key owned by another node are rejected (single-writer).
/// Reads serve whatever is held locally, whatever the role, and never
/// block on the network: an entry known only as a proxy reads as absent.
///
/// Call `shutdown()` when done with the map; the channel registration
/// otherwise keeps the instance alive and receiving.
pub struct ReplicatedMap<K, V> {
    pub(crate) map_id: String,
    pub(crate) channel: Arc<dyn GroupChannel>,
    pub(crate) engine: ReplicationEngine,
    pub(crate) tracker: MembershipTracker,
    pub(crate) entries: DashMap<K, MapEntry<K, V>>,
    /// Serializes the membership-reaction passes, which edit many
    /// entries' backup lists together.
    pub(crate) structure_lock: tokio::sync::Mutex<()>,
    pub(crate) promotion_hook: RwLock<Option<PromotionHook<K, V>>>,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(channel: Arc<dyn GroupChannel>, map_id: &str) -> Arc<Self> {
        Self::with_kinds(channel, map_id, MessageKinds::default())
    }

    pub fn with_kinds(
        channel: Arc<dyn GroupChannel>,
        map_id: &str,
        kinds: MessageKinds,
    ) -> Arc<Self> {
        let engine = ReplicationEngine::new(channel.clone(), map_id, kinds);
        let tracker = MembershipTracker::new(channel.local_node());
        Arc::new(Self {
            map_id: map_id.to_string(),
            channel,
            engine,
            tracker,
            entries: DashMap::new(),
            structure_lock: tokio::sync::Mutex::new(()),
            promotion_hook: RwLock::new(None),
        })
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn local_node(&self) -> NodeId {
        self.engine.local_node()
    }

    /// Register the callback invoked when this node becomes primary for a
    /// previously-foreign key, e.g. to resume emitting writes for it.
    pub fn on_local_promotion<F>(&self, hook: F)
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        *self.promotion_hook.write() = Some(Arc::new(hook));
    }

    /// Join the group: seed the membership tracker, register for inbound
    /// traffic, and pull a full-state snapshot from the longest-lived
    /// member that will serve one.
    pub async fn start(self: Arc<Self>) {
        for node in self.channel.live_members() {
            self.tracker.member_added(&node);
        }
        self.channel.register(&self.map_id, self.clone());

        for node in self.tracker.live_nodes() {
            match self.channel.fetch_state(&node, &self.map_id).await {
                Ok(messages) => {
                    let total = messages.len();
                    for message in messages {
                        if let Err(error) = self.apply_message(message) {
                            tracing::warn!("Discarding state entry from {}: {}", node, error);
                        }
                    }
                    tracing::info!(
                        "Map '{}': transferred {} entr(ies) from {}",
                        self.map_id,
                        total,
                        node
                    );
                    break;
                }
                Err(error) => {
                    tracing::warn!("State transfer from {} failed: {}", node, error);
                }
            }
        }

        tracing::info!(
            "Replicated map '{}' started on {} with {} peer(s)",
            self.map_id,
            self.local_node(),
            self.tracker.len()
        );
    }

    /// Leave the group and discard all map state. Mandatory on teardown.
    pub fn shutdown(&self) {
        self.channel.unregister(&self.map_id);
        self.entries.clear();
        self.tracker.clear();
        tracing::info!("Replicated map '{}' shut down", self.map_id);
    }

    /// Write a key this node owns (or that nobody owns yet), then push
    /// copies to the live backup set. The local write commits first; a
    /// replication failure that reaches nobody surfaces as
    /// `ReplicationFailed` so the caller can retry or accept reduced
    /// durability.
    pub async fn put(&self, key: K, value: V) -> Result<(), MapError> {
        let local = self.local_node();
        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_primary()
                && let Some(owner) = entry.primary.clone()
                && owner != local
            {
                return Err(MapError::NotOwner {
                    key: key.to_string(),
                    owner,
                });
            }
        }

        let value_json = serde_json::to_string(&value)?;
        let targets = self.tracker.live_nodes();
        self.entries.insert(
            key.clone(),
            MapEntry::primary(key.clone(), value, local, targets.clone()),
        );

        match self
            .engine
            .publish(&key.to_string(), &value_json, &targets)
            .await
        {
            Ok(accepted) => {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.backups = accepted;
                }
                Ok(())
            }
            Err(error) => {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.backups = Vec::new();
                }
                Err(error)
            }
        }
    }

    /// Local value for `key`, whatever the role. A proxy entry holds no
    /// value and reads as absent; this call never fetches remotely.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entry = self.entries.get_mut(key)?;
        entry.touch();
        entry.value.clone()
    }

    /// Delete a key this node owns and propagate the deletion to the
    /// group. The local removal commits first.
    pub async fn remove(&self, key: &K) -> Result<Option<V>, MapError> {
        let local = self.local_node();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_primary()
                && let Some(owner) = entry.primary.clone()
                && owner != local
            {
                return Err(MapError::NotOwner {
                    key: key.to_string(),
                    owner,
                });
            }
        } else {
            return Ok(None);
        }

        let previous = self
            .entries
            .remove(key)
            .and_then(|(_, entry)| entry.value);
        let targets = self.tracker.live_nodes();
        self.engine.publish_remove(&key.to_string(), &targets).await?;
        Ok(previous)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cloned replication state of one entry, for diagnostics and tests.
    pub fn entry(&self, key: &K) -> Option<MapEntry<K, V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Apply one inbound replication message. A message that cannot be
    /// decoded rejects alone; it never takes the map down.
    pub fn apply_message(&self, message: MapMessage) -> Result<(), MapError> {
        if message.map_id != self.map_id {
            return Err(MapError::Malformed(format!(
                "message for map '{}' delivered to map '{}'",
                message.map_id, self.map_id
            )));
        }
        let key: K = message
            .key
            .parse()
            .map_err(|error: <K as FromStr>::Err| {
                MapError::Malformed(format!("bad key '{}': {}", message.key, error))
            })?;

        match message.kind {
            MessageKind::IncrementalCopy | MessageKind::FullStateTransfer => {
                if !message.value_set {
                    return Err(MapError::Malformed(format!(
                        "copy message for '{}' carries no value",
                        message.key
                    )));
                }
                let value_json = message.value_json.as_deref().ok_or_else(|| {
                    MapError::Malformed(format!(
                        "copy message for '{}' carries no value",
                        message.key
                    ))
                })?;
                let value: V = serde_json::from_str(value_json)?;

                match self.entries.get_mut(&key) {
                    Some(mut entry) => {
                        entry.value = Some(value);
                        entry.role = Role::Copy;
                        entry.primary = Some(message.sender.clone());
                        entry.backups = message.targets.clone();
                        entry.touch();
                    }
                    None => {
                        self.entries.insert(
                            key.clone(),
                            MapEntry::replica(
                                key,
                                value,
                                Role::Copy,
                                message.sender.clone(),
                                message.targets.clone(),
                            ),
                        );
                    }
                }
                Ok(())
            }

            MessageKind::OwnershipNotify => {
                match self.entries.get_mut(&key) {
                    Some(mut entry) => {
                        // A competing primary yields to the announcer;
                        // this is how a transient dual-primary heals.
                        if entry.is_primary() {
                            entry.role = Role::Copy;
                        }
                        entry.primary = Some(message.sender.clone());
                        entry.backups = message.targets.clone();
                    }
                    None => {
                        // Ownership for a key we never saw: keep a
                        // value-less placeholder referencing the owner.
                        self.entries.insert(
                            key.clone(),
                            MapEntry::proxy(
                                key,
                                message.sender.clone(),
                                message.targets.clone(),
                            ),
                        );
                    }
                }
                Ok(())
            }

            MessageKind::Remove => {
                self.entries.remove(&key);
                Ok(())
            }
        }
    }

    /// One state-transfer message per value-holding entry, served to a
    /// joining node. Proxies are skipped; the joiner learns about those
    /// keys from their primaries' next announcement.
    pub fn snapshot_messages(&self) -> Vec<MapMessage> {
        let local = self.local_node();
        self.entries
            .iter()
            .filter_map(|entry| {
                let value = entry.value.as_ref()?;
                let value_json = match serde_json::to_string(value) {
                    Ok(json) => json,
                    Err(error) => {
                        tracing::warn!("Skipping unserializable snapshot entry: {}", error);
                        return None;
                    }
                };
                let primary = entry.primary.clone().unwrap_or_else(|| local.clone());
                Some(self.engine.state_message(
                    &entry.key.to_string(),
                    value_json,
                    primary,
                    entry.backups.clone(),
                ))
            })
            .collect()
    }
}

#[async_trait]
impl<K, V> GroupListener for ReplicatedMap<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn on_message(&self, message: MapMessage) -> anyhow::Result<()> {
        self.apply_message(message)?;
        Ok(())
    }

    async fn member_added(&self, node: &NodeId) {
        if self.tracker.member_added(node) {
            self.handle_member_added(node).await;
        }
    }

    async fn member_removed(&self, node: &NodeId) {
        if self.tracker.member_removed(node) {
            self.handle_member_removed(node).await;
        }
    }

    fn state_snapshot(&self) -> Vec<MapMessage> {
        self.snapshot_messages()
    }
}
