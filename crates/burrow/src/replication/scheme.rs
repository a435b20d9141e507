//! Replication schemes.
//!
//! A [`ReplicationScheme`] answers two questions for a partition key: which
//! remote replicas hold the partition, and whether this node keeps a local
//! copy. [`StandaloneReplicationScheme`] serves single-node deployments;
//! [`DistributedReplicationScheme`] places partitions on cluster members
//! through a pluggable [`PlacementStrategy`].

use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Identifier of a node holding replicas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Creates a replica id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A cluster member as seen by placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaRef {
    /// Member id.
    pub id: ReplicaId,
    /// Transport address; opaque to the storage engine.
    pub address: String,
}

impl ReplicaRef {
    /// Creates a replica reference.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: ReplicaId::new(id),
            address: address.into(),
        }
    }
}

/// Placement policy for partitions.
pub trait ReplicationScheme: Send + Sync {
    /// Remote replicas of `key`, in placement order. The local node is never
    /// included.
    fn replicas_for(&self, key: &PartitionKey) -> Result<Vec<ReplicaRef>>;

    /// Returns true if this node stores `key`.
    fn keep_local_replica_for(&self, key: &PartitionKey) -> Result<bool>;
}

/// Single-node scheme: no remote replicas, every partition kept locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneReplicationScheme;

impl ReplicationScheme for StandaloneReplicationScheme {
    fn replicas_for(&self, _key: &PartitionKey) -> Result<Vec<ReplicaRef>> {
        Ok(Vec::new())
    }

    fn keep_local_replica_for(&self, _key: &PartitionKey) -> Result<bool> {
        Ok(true)
    }
}

/// Read-only view of the current cluster members.
pub trait MembershipView: Send + Sync {
    /// Current members, the local node included.
    fn members(&self) -> Vec<ReplicaRef>;
}

/// Membership list replaced wholesale by its owner.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: RwLock<Vec<ReplicaRef>>,
}

impl StaticMembership {
    /// Creates a membership view over `members`.
    pub fn new(members: Vec<ReplicaRef>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    /// Replaces the member list.
    pub fn set_members(&self, members: Vec<ReplicaRef>) {
        *self.members.write() = members;
    }
}

impl MembershipView for StaticMembership {
    fn members(&self) -> Vec<ReplicaRef> {
        self.members.read().clone()
    }
}

/// Chooses the members holding a partition.
pub trait PlacementStrategy: Send + Sync {
    /// Returns up to `count` distinct members for `key`, in placement order.
    ///
    /// The result must depend only on `key` and the set of members.
    fn place(&self, key: &PartitionKey, members: &[ReplicaRef], count: usize) -> Vec<ReplicaRef>;
}

/// Consistent-hash ring placement.
///
/// Keys and members are hashed onto a `u64` ring with xxh64; a key is placed
/// on the members nearest to it clockwise. Adding or removing a member only
/// moves the keys adjacent to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashRingPlacement {
    seed: u64,
}

impl HashRingPlacement {
    /// Creates a ring with the default seed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ring with a custom hash seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl PlacementStrategy for HashRingPlacement {
    fn place(&self, key: &PartitionKey, members: &[ReplicaRef], count: usize) -> Vec<ReplicaRef> {
        let key_hash = xxhash_rust::xxh64::xxh64(key.as_bytes(), self.seed);
        let mut ring: Vec<(u64, &ReplicaRef)> = members
            .iter()
            .map(|member| {
                let member_hash =
                    xxhash_rust::xxh64::xxh64(member.id.as_str().as_bytes(), self.seed);
                // clockwise distance on the ring
                (member_hash.wrapping_sub(key_hash), member)
            })
            .collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        ring.dedup_by(|a, b| a.1.id == b.1.id);
        ring.into_iter()
            .take(count)
            .map(|(_, member)| member.clone())
            .collect()
    }
}

/// Scheme placing each partition on `replication_factor` cluster members.
pub struct DistributedReplicationScheme {
    local: ReplicaId,
    membership: Arc<dyn MembershipView>,
    placement: Box<dyn PlacementStrategy>,
    replication_factor: usize,
}

impl fmt::Debug for DistributedReplicationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedReplicationScheme")
            .field("local", &self.local)
            .field("replication_factor", &self.replication_factor)
            .finish_non_exhaustive()
    }
}

impl DistributedReplicationScheme {
    /// Creates a scheme using [`HashRingPlacement`].
    pub fn new(
        local: ReplicaId,
        membership: Arc<dyn MembershipView>,
        replication_factor: usize,
    ) -> Result<Self> {
        Self::with_placement(
            local,
            membership,
            Box::new(HashRingPlacement::new()),
            replication_factor,
        )
    }

    /// Creates a scheme with a custom placement strategy.
    pub fn with_placement(
        local: ReplicaId,
        membership: Arc<dyn MembershipView>,
        placement: Box<dyn PlacementStrategy>,
        replication_factor: usize,
    ) -> Result<Self> {
        if replication_factor == 0 {
            return Err(BurrowError::Validation(
                "replication factor must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            local,
            membership,
            placement,
            replication_factor,
        })
    }

    /// Id of the local node.
    pub fn local(&self) -> &ReplicaId {
        &self.local
    }

    /// Number of members holding each partition.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Every member holding `key`, the local node included.
    pub fn replica_set(&self, key: &PartitionKey) -> Result<Vec<ReplicaRef>> {
        let members = self.membership.members();
        if members.is_empty() {
            return Err(BurrowError::NoReplicasAvailable { key: *key });
        }
        let placed = self.placement.place(key, &members, self.replication_factor);
        if placed.is_empty() {
            return Err(BurrowError::NoReplicasAvailable { key: *key });
        }
        Ok(placed)
    }
}

impl ReplicationScheme for DistributedReplicationScheme {
    fn replicas_for(&self, key: &PartitionKey) -> Result<Vec<ReplicaRef>> {
        Ok(self
            .replica_set(key)?
            .into_iter()
            .filter(|member| member.id != self.local)
            .collect())
    }

    fn keep_local_replica_for(&self, key: &PartitionKey) -> Result<bool> {
        Ok(self
            .replica_set(key)?
            .iter()
            .any(|member| member.id == self.local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;

    fn members(n: usize) -> Vec<ReplicaRef> {
        (0..n)
            .map(|i| ReplicaRef::new(format!("node-{}", i), format!("10.0.0.{}:7000", i)))
            .collect()
    }

    fn ids(replicas: &[ReplicaRef]) -> Vec<String> {
        replicas.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn test_standalone() {
        let scheme = StandaloneReplicationScheme;
        let key = Hash160::digest(b"p");
        assert!(scheme.replicas_for(&key).unwrap().is_empty());
        assert!(scheme.keep_local_replica_for(&key).unwrap());
    }

    #[test]
    fn test_hash_ring_is_deterministic() {
        let ring = HashRingPlacement::new();
        let key = Hash160::digest(b"partition");
        let mut shuffled = members(5);
        shuffled.reverse();
        let a = ring.place(&key, &members(5), 3);
        let b = ring.place(&key, &shuffled, 3);
        assert_eq!(a.len(), 3);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_hash_ring_caps_at_member_count() {
        let ring = HashRingPlacement::new();
        let key = Hash160::digest(b"partition");
        assert_eq!(ring.place(&key, &members(2), 5).len(), 2);
        let mut duplicated = members(2);
        duplicated.extend(members(2));
        assert_eq!(ring.place(&key, &duplicated, 5).len(), 2);
    }

    #[test]
    fn test_hash_ring_spreads_keys() {
        let ring = HashRingPlacement::new();
        let all = members(4);
        let mut primaries = std::collections::HashSet::new();
        for i in 0..200 {
            let key = Hash160::digest(format!("k{}", i).as_bytes());
            primaries.insert(ring.place(&key, &all, 1)[0].id.clone());
        }
        assert!(primaries.len() > 1);
    }

    #[test]
    fn test_distributed_local_membership() {
        let membership = Arc::new(StaticMembership::new(members(5)));
        let key = Hash160::digest(b"events");
        let placed = HashRingPlacement::new().place(&key, &members(5), 2);
        let inside = placed[0].id.clone();
        let outside = members(5)
            .into_iter()
            .find(|m| !placed.contains(m))
            .unwrap()
            .id;

        let scheme =
            DistributedReplicationScheme::new(inside.clone(), membership.clone(), 2).unwrap();
        assert!(scheme.keep_local_replica_for(&key).unwrap());
        let remote = scheme.replicas_for(&key).unwrap();
        assert_eq!(remote.len(), 1);
        assert!(remote.iter().all(|r| r.id != inside));

        let scheme = DistributedReplicationScheme::new(outside, membership, 2).unwrap();
        assert!(!scheme.keep_local_replica_for(&key).unwrap());
        assert_eq!(ids(&scheme.replicas_for(&key).unwrap()), ids(&placed));
    }

    #[test]
    fn test_empty_membership_has_no_replicas() {
        let membership = Arc::new(StaticMembership::default());
        let scheme =
            DistributedReplicationScheme::new("node-0".into(), membership.clone(), 3).unwrap();
        let key = Hash160::digest(b"p");
        assert!(matches!(
            scheme.replicas_for(&key),
            Err(BurrowError::NoReplicasAvailable { .. })
        ));
        assert!(scheme.keep_local_replica_for(&key).is_err());

        membership.set_members(members(1));
        assert!(scheme.keep_local_replica_for(&key).unwrap());
    }

    #[test]
    fn test_zero_replication_factor_is_rejected() {
        let membership = Arc::new(StaticMembership::new(members(1)));
        assert!(DistributedReplicationScheme::new("node-0".into(), membership, 0).is_err());
    }
}
