//! Group Channel Boundary
//!
//! The replicated map core never talks to sockets directly. It consumes a
//! `GroupChannel` (member snapshot, fault-classified send, bulk state pull)
//! and exposes itself back as a `GroupListener` (inbound messages plus
//! membership callbacks). `GossipChannel` is the production implementation;
//! the test suite wires maps together through an in-process hub instead.

use async_trait::async_trait;
use std::sync::Arc;

use super::types::{NodeId, SendError};
use crate::map::protocol::MapMessage;

/// Receiver side of a map's channel registration.
///
/// Membership callbacks are delivered FIFO per node. `on_message` errors
/// are reported back to the sender as remote-processing faults, not
/// transport faults, so a throwing replica is not mistaken for a dead one.
#[async_trait]
pub trait GroupListener: Send + Sync {
    /// Apply one inbound replication message.
    async fn on_message(&self, message: MapMessage) -> anyhow::Result<()>;

    /// A node joined the group.
    async fn member_added(&self, node: &NodeId);

    /// A node left the group or was declared dead.
    async fn member_removed(&self, node: &NodeId);

    /// Full-state snapshot served to joining nodes, one message per entry.
    fn state_snapshot(&self) -> Vec<MapMessage>;
}

/// Best-effort group communication primitive consumed by the map.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Point-in-time snapshot of the live node set, excluding self.
    fn live_members(&self) -> Vec<NodeId>;

    /// Deliver `message` to every target. A partial or total failure is
    /// returned as `SendError::Faulty` with one classified fault per
    /// missed target; the message may still have reached the others.
    async fn send(&self, targets: &[NodeId], message: MapMessage) -> Result<(), SendError>;

    /// Pull the full state of `map_id` from one member, used by a
    /// joining node before it starts serving.
    async fn fetch_state(&self, from: &NodeId, map_id: &str) -> anyhow::Result<Vec<MapMessage>>;

    /// Subscribe a map to inbound messages and membership events.
    fn register(&self, map_id: &str, listener: Arc<dyn GroupListener>);

    /// Drop a map's registration. Mandatory on shutdown; a registered
    /// listener keeps the map alive and receiving.
    fn unregister(&self, map_id: &str);
}
