//! Replica placement and replication progress.
//!
//! - [`scheme`]: which nodes hold a partition
//! - [`state`]: how far each replica of a partition has caught up

pub mod scheme;
pub mod state;

pub use scheme::{
    DistributedReplicationScheme, HashRingPlacement, MembershipView, PlacementStrategy,
    ReplicaId, ReplicaRef, ReplicationScheme, StandaloneReplicationScheme, StaticMembership,
};
pub use state::ReplicationState;
