//! In-process group channel for multi-node tests.
//!
//! A `LocalHub` plays the part of the network: every node is a slot in
//! one shared registry and delivery is a direct call into the target's
//! listener. Tests steer failures explicitly: `kill` takes a node out
//! and fires membership callbacks on the survivors, `set_unreachable`
//! makes sends fail as transport faults without any membership event,
//! and `set_rejecting` makes the target answer with a remote-processing
//! fault.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::map::protocol::MapMessage;

use super::group::{GroupChannel, GroupListener};
use super::types::{FaultCause, NodeId, SendError, SendFault};

#[derive(Default)]
struct LocalNode {
    alive: bool,
    unreachable: bool,
    rejecting: bool,
    listeners: HashMap<String, Arc<dyn GroupListener>>,
}

pub struct LocalHub {
    nodes: DashMap<NodeId, LocalNode>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
        })
    }

    /// Add a node and announce it to every existing member's listeners.
    pub async fn join(self: &Arc<Self>, name: &str) -> Arc<LocalChannel> {
        let node = NodeId::from(name);
        let peers = self.listener_list(Some(&node));
        self.nodes.insert(
            node.clone(),
            LocalNode {
                alive: true,
                ..Default::default()
            },
        );
        for listener in peers {
            listener.member_added(&node).await;
        }
        Arc::new(LocalChannel {
            hub: self.clone(),
            node,
        })
    }

    /// Take a node down: its listeners are dropped, its slot marked
    /// dead, and the survivors are told it is gone.
    pub async fn kill(&self, node: &NodeId) {
        if let Some(mut slot) = self.nodes.get_mut(node) {
            slot.alive = false;
            slot.listeners.clear();
        }
        for listener in self.listener_list(Some(node)) {
            listener.member_removed(node).await;
        }
    }

    /// Sends to this node fail as transport faults while set.
    pub fn set_unreachable(&self, node: &NodeId, unreachable: bool) {
        if let Some(mut slot) = self.nodes.get_mut(node) {
            slot.unreachable = unreachable;
        }
    }

    /// This node answers every message with a processing error while set.
    pub fn set_rejecting(&self, node: &NodeId, rejecting: bool) {
        if let Some(mut slot) = self.nodes.get_mut(node) {
            slot.rejecting = rejecting;
        }
    }

    fn listener_list(&self, except: Option<&NodeId>) -> Vec<Arc<dyn GroupListener>> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().alive && Some(entry.key()) != except)
            .flat_map(|entry| {
                entry
                    .value()
                    .listeners
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

pub struct LocalChannel {
    hub: Arc<LocalHub>,
    node: NodeId,
}

enum Delivery {
    Handler(Arc<dyn GroupListener>),
    Fault(FaultCause),
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn live_members(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .hub
            .nodes
            .iter()
            .filter(|entry| entry.value().alive && *entry.key() != self.node)
            .map(|entry| entry.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    async fn send(&self, targets: &[NodeId], message: MapMessage) -> Result<(), SendError> {
        let mut faults = Vec::new();

        for target in targets {
            let delivery = match self.hub.nodes.get(target) {
                None => Delivery::Fault(FaultCause::Transport("unknown member".to_string())),
                Some(slot) => {
                    if !slot.alive || slot.unreachable {
                        Delivery::Fault(FaultCause::Transport("unreachable".to_string()))
                    } else if slot.rejecting {
                        Delivery::Fault(FaultCause::Remote("peer replied 500".to_string()))
                    } else {
                        match slot.listeners.get(&message.map_id) {
                            Some(listener) => Delivery::Handler(listener.clone()),
                            None => {
                                Delivery::Fault(FaultCause::Remote("no such map".to_string()))
                            }
                        }
                    }
                }
            };

            match delivery {
                Delivery::Handler(listener) => {
                    if let Err(error) = listener.on_message(message.clone()).await {
                        faults.push(SendFault {
                            node: target.clone(),
                            cause: FaultCause::Remote(error.to_string()),
                        });
                    }
                }
                Delivery::Fault(cause) => faults.push(SendFault {
                    node: target.clone(),
                    cause,
                }),
            }
        }

        if faults.is_empty() {
            Ok(())
        } else {
            Err(SendError::Faulty { faults })
        }
    }

    async fn fetch_state(&self, from: &NodeId, map_id: &str) -> anyhow::Result<Vec<MapMessage>> {
        let listener = {
            let slot = self
                .hub
                .nodes
                .get(from)
                .ok_or_else(|| anyhow::anyhow!("unknown member {}", from))?;
            if !slot.alive || slot.unreachable {
                anyhow::bail!("member {} unreachable", from);
            }
            slot.listeners
                .get(map_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no map '{}' on {}", map_id, from))?
        };
        Ok(listener.state_snapshot())
    }

    fn register(&self, map_id: &str, listener: Arc<dyn GroupListener>) {
        if let Some(mut slot) = self.hub.nodes.get_mut(&self.node) {
            slot.listeners.insert(map_id.to_string(), listener);
        }
    }

    fn unregister(&self, map_id: &str) {
        if let Some(mut slot) = self.hub.nodes.get_mut(&self.node) {
            slot.listeners.remove(map_id);
        }
    }
}
