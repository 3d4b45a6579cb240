//! Ownership Repair
//!
//! The membership-reaction passes of the replicated map: re-electing
//! owners after a departure and refreshing backup sets after a join.
//! Both passes run under the map-structure lock so two membership events
//! cannot interleave their per-entry edits; repair of one key never
//! blocks repair of the rest.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::str::FromStr;
use std::time::Instant;

use crate::channel::types::NodeId;

use super::entry::Role;
use super::store::ReplicatedMap;

impl<K, V> ReplicatedMap<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Scan every locally held entry after `node` left the group.
    ///
    /// Per entry: departed backups are pruned; a locally owned entry gets
    /// its backup set recomputed and re-announced; an entry whose primary
    /// departed becomes ownerless; and an ownerless copy whose backup
    /// list starts with this node is taken over. Send failures are
    /// logged per key and the scan continues.
    pub(crate) async fn handle_member_removed(&self, node: &NodeId) {
        let _structure = self.structure_lock.lock().await;
        let started = Instant::now();
        let local = self.local_node();

        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let key_label = key.to_string();

            let locally_primary = {
                let Some(mut entry) = self.entries.get_mut(&key) else {
                    continue;
                };
                entry.backups.retain(|backup| backup != node);
                if entry.is_primary() {
                    true
                } else {
                    if entry.primary.as_ref() == Some(node) {
                        // Ownerless until the first backup in line
                        // notices, below or on its own pass.
                        entry.primary = None;
                    }
                    false
                }
            };

            if locally_primary {
                // The departed node may have been one of our backups;
                // rebuild the set from the live view and re-announce.
                let targets = self.tracker.live_nodes();
                match self.engine.send_ownership(&key_label, &targets).await {
                    Ok(()) => {
                        if let Some(mut entry) = self.entries.get_mut(&key) {
                            entry.backups = targets;
                        }
                    }
                    Err(error) => {
                        tracing::error!(
                            "Unable to re-announce ownership of '{}': {}",
                            key_label,
                            error
                        );
                    }
                }
            }

            let promoted_value = {
                let Some(mut entry) = self.entries.get_mut(&key) else {
                    continue;
                };
                if entry.primary.is_none()
                    && entry.role.promotable()
                    && entry.first_backup() == Some(&local)
                {
                    entry.role = Role::Primary;
                    entry.primary = Some(local.clone());
                    entry.value.clone()
                } else {
                    None
                }
            };

            if let Some(value) = promoted_value {
                tracing::info!("Taking over key '{}' from departed {}", key_label, node);
                let targets = self.tracker.live_nodes();
                match self.engine.send_ownership(&key_label, &targets).await {
                    Ok(()) => {
                        if let Some(mut entry) = self.entries.get_mut(&key) {
                            entry.backups = targets;
                        }
                    }
                    Err(error) => {
                        tracing::error!(
                            "Unable to announce takeover of '{}': {}",
                            key_label,
                            error
                        );
                    }
                }

                let hook = self.promotion_hook.read().clone();
                if let Some(hook) = hook {
                    hook(&key, &value);
                }
            }
        }

        tracing::info!(
            "Ownership repair after departure of {} completed in {:?}",
            node,
            started.elapsed()
        );
    }

    /// Refresh the backup sets of locally owned entries after `node`
    /// joined, so the joiner is eventually named a backup of every
    /// primary held here. Values reach the joiner through its own
    /// start-time state transfer; nothing is sent from this pass.
    pub(crate) async fn handle_member_added(&self, node: &NodeId) {
        let _structure = self.structure_lock.lock().await;
        let live = self.tracker.live_nodes();
        let mut refreshed = 0usize;

        for mut entry in self.entries.iter_mut() {
            if entry.is_primary() && !entry.backups.contains(node) {
                entry.backups = live.clone();
                refreshed += 1;
            }
        }

        if refreshed > 0 {
            tracing::info!(
                "Refreshed backup sets of {} entr(ies) after {} joined",
                refreshed,
                node
            );
        }
    }
}
