//! Group Communication Module
//!
//! Everything the replicated map needs from the process group: who is
//! alive, delivery of replication messages with per-target fault
//! classification, and membership-change callbacks.
//!
//! ## Core Mechanisms
//! - **Boundary traits**: `GroupChannel` (consumed by the map) and
//!   `GroupListener` (implemented by the map), so the map core never
//!   touches sockets.
//! - **Gossip membership**: `GossipChannel` runs a SWIM-like UDP protocol
//!   with Suspect -> Dead timeouts and incarnation-based refutation.
//! - **Fault classification**: a send distinguishes targets that were
//!   unreachable (transport fault) from targets that answered with an
//!   error (remote-processing fault); only the former indicate death.

pub mod gossip;
pub mod group;
pub mod types;

#[cfg(test)]
pub mod local;

#[cfg(test)]
mod tests;

pub use gossip::GossipChannel;
pub use group::{GroupChannel, GroupListener};
pub use types::{FaultCause, Member, NodeId, NodeState, SendError, SendFault};
