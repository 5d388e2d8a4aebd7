//! Segment ownership descriptors
//!
//! A `ConsistentHash` maps every segment to an ordered list of owners, the
//! first being the primary owner. It is produced by a `ConsistentHashFactory`;
//! the coordinator only relies on the factory contract (create, update
//! members, rebalance, union). `RingConsistentHashFactory` is the default
//! factory and places segments on a hash ring of virtual nodes.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use super::NodeId;

/// Ownership of every segment of a cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentHash<M = NodeId> {
    num_owners: usize,
    members: Vec<M>,
    /// Parallel to `members`
    capacity_factors: Vec<f32>,
    segment_owners: Vec<Vec<M>>,
}

impl<M: Clone + PartialEq> ConsistentHash<M> {
    pub fn new(
        num_owners: usize,
        members: Vec<M>,
        capacity_factors: Vec<f32>,
        segment_owners: Vec<Vec<M>>,
    ) -> Self {
        Self {
            num_owners,
            members,
            capacity_factors,
            segment_owners,
        }
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    pub fn members(&self) -> &[M] {
        &self.members
    }

    pub fn capacity_factors(&self) -> &[f32] {
        &self.capacity_factors
    }

    pub fn contains_member(&self, member: &M) -> bool {
        self.members.contains(member)
    }

    /// Owners of a segment, primary first
    pub fn segment_owners(&self, segment: usize) -> &[M] {
        self.segment_owners
            .get(segment)
            .map(|owners| owners.as_slice())
            .unwrap_or(&[])
    }

    pub fn primary_owner(&self, segment: usize) -> Option<&M> {
        self.segment_owners(segment).first()
    }

    /// Re-express ownership in another identity space.
    ///
    /// Returns `None` as soon as one member has no counterpart.
    pub fn remap<N, F>(&self, mut map: F) -> Option<ConsistentHash<N>>
    where
        N: Clone + PartialEq,
        F: FnMut(&M) -> Option<N>,
    {
        let mut translated: Vec<(M, N)> = Vec::with_capacity(self.members.len());
        for member in &self.members {
            translated.push((member.clone(), map(member)?));
        }
        let lookup = |member: &M| {
            translated
                .iter()
                .find(|(from, _)| from == member)
                .map(|(_, to)| to.clone())
        };

        let members = translated.iter().map(|(_, to)| to.clone()).collect();
        let mut segment_owners = Vec::with_capacity(self.segment_owners.len());
        for owners in &self.segment_owners {
            let mut mapped = Vec::with_capacity(owners.len());
            for owner in owners {
                mapped.push(lookup(owner)?);
            }
            segment_owners.push(mapped);
        }

        Some(ConsistentHash {
            num_owners: self.num_owners,
            members,
            capacity_factors: self.capacity_factors.clone(),
            segment_owners,
        })
    }
}

/// The partitioning function consumed by the coordinator
pub trait ConsistentHashFactory: Send + Sync + Debug {
    /// Build a fresh ownership assignment over `members`
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[NodeId],
        capacity_factors: &HashMap<NodeId, f32>,
    ) -> ConsistentHash;

    /// Adjust `base` to a new member list, moving as little as possible.
    ///
    /// Departed members lose their segments; a segment left without owners
    /// gets new ones. Added members own nothing until the next `rebalance`.
    fn update_members(
        &self,
        base: &ConsistentHash,
        members: &[NodeId],
        capacity_factors: &HashMap<NodeId, f32>,
    ) -> ConsistentHash;

    /// Compute the balanced assignment for the members of `base`
    fn rebalance(&self, base: &ConsistentHash) -> ConsistentHash;

    /// Union of two assignments over the same segments, `first` taking
    /// precedence in member and owner order
    fn union(&self, first: &ConsistentHash, second: &ConsistentHash) -> ConsistentHash;
}

/// Consistent hash ring placing segments on virtual nodes
#[derive(Debug, Clone)]
pub struct RingConsistentHashFactory {
    virtual_nodes_per_member: usize,
}

impl RingConsistentHashFactory {
    pub fn new(virtual_nodes_per_member: usize) -> Self {
        Self {
            virtual_nodes_per_member: virtual_nodes_per_member.max(1),
        }
    }

    fn build_ring(
        &self,
        members: &[NodeId],
        capacity_factors: &[f32],
    ) -> BTreeMap<u64, NodeId> {
        let mut ring = BTreeMap::new();
        for (member, capacity) in members.iter().zip(capacity_factors) {
            if *capacity <= 0.0 {
                continue;
            }
            let virtual_nodes =
                ((self.virtual_nodes_per_member as f32 * capacity).round() as usize).max(1);
            for i in 0..virtual_nodes {
                ring.insert(hash(&format!("{}:{}", member, i)), member.clone());
            }
        }
        ring
    }

    /// Walk the ring clockwise from the segment position collecting distinct owners
    fn ring_owners(ring: &BTreeMap<u64, NodeId>, segment: usize, num_segments: usize, num_owners: usize) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = Vec::with_capacity(num_owners);
        if ring.is_empty() {
            return owners;
        }
        let position = segment_position(segment, num_segments);
        for member in ring.range(position..).chain(ring.range(..position)).map(|(_, m)| m) {
            if owners.len() == num_owners {
                break;
            }
            if !owners.contains(member) {
                owners.push(member.clone());
            }
        }
        owners
    }

    fn factors_for(members: &[NodeId], capacity_factors: &HashMap<NodeId, f32>) -> Vec<f32> {
        members
            .iter()
            .map(|m| capacity_factors.get(m).copied().unwrap_or(1.0))
            .collect()
    }
}

impl Default for RingConsistentHashFactory {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ConsistentHashFactory for RingConsistentHashFactory {
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[NodeId],
        capacity_factors: &HashMap<NodeId, f32>,
    ) -> ConsistentHash {
        let factors = Self::factors_for(members, capacity_factors);
        let ring = self.build_ring(members, &factors);
        let segment_owners = (0..num_segments)
            .map(|segment| Self::ring_owners(&ring, segment, num_segments, num_owners))
            .collect();
        ConsistentHash::new(num_owners, members.to_vec(), factors, segment_owners)
    }

    fn update_members(
        &self,
        base: &ConsistentHash,
        members: &[NodeId],
        capacity_factors: &HashMap<NodeId, f32>,
    ) -> ConsistentHash {
        let factors = Self::factors_for(members, capacity_factors);
        let usable = |member: &NodeId| {
            members
                .iter()
                .position(|m| m == member)
                .map(|index| factors[index] > 0.0)
                .unwrap_or(false)
        };

        let mut ring = None;
        let num_segments = base.num_segments();
        let segment_owners = (0..num_segments)
            .map(|segment| {
                let kept: Vec<NodeId> = base
                    .segment_owners(segment)
                    .iter()
                    .filter(|owner| usable(owner))
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    return kept;
                }
                let ring = ring.get_or_insert_with(|| self.build_ring(members, &factors));
                Self::ring_owners(ring, segment, num_segments, base.num_owners())
            })
            .collect();

        ConsistentHash::new(base.num_owners(), members.to_vec(), factors, segment_owners)
    }

    fn rebalance(&self, base: &ConsistentHash) -> ConsistentHash {
        let capacity_factors: HashMap<NodeId, f32> = base
            .members()
            .iter()
            .cloned()
            .zip(base.capacity_factors().iter().copied())
            .collect();
        self.create(
            base.num_owners(),
            base.num_segments(),
            base.members(),
            &capacity_factors,
        )
    }

    fn union(&self, first: &ConsistentHash, second: &ConsistentHash) -> ConsistentHash {
        let mut members = first.members().to_vec();
        let mut factors = first.capacity_factors().to_vec();
        for (member, factor) in second.members().iter().zip(second.capacity_factors()) {
            if !members.contains(member) {
                members.push(member.clone());
                factors.push(*factor);
            }
        }

        let num_segments = first.num_segments().max(second.num_segments());
        let segment_owners = (0..num_segments)
            .map(|segment| {
                let mut owners = first.segment_owners(segment).to_vec();
                for owner in second.segment_owners(segment) {
                    if !owners.contains(owner) {
                        owners.push(owner.clone());
                    }
                }
                owners
            })
            .collect();

        ConsistentHash::new(
            first.num_owners().max(second.num_owners()),
            members,
            factors,
            segment_owners,
        )
    }
}

fn segment_position(segment: usize, num_segments: usize) -> u64 {
    let width = u64::MAX / num_segments.max(1) as u64;
    width.saturating_mul(segment as u64)
}

fn hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    fn owned_segments(ch: &ConsistentHash, member: &str) -> Vec<usize> {
        let member = NodeId::from(member);
        (0..ch.num_segments())
            .filter(|segment| ch.segment_owners(*segment).contains(&member))
            .collect()
    }

    #[test]
    fn test_create_assigns_distinct_owners() {
        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(2, 16, &nodes(&["a", "b", "c"]), &HashMap::new());

        assert_eq!(ch.num_segments(), 16);
        for segment in 0..16 {
            let owners = ch.segment_owners(segment);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_zero_capacity_member_owns_nothing() {
        let factory = RingConsistentHashFactory::default();
        let mut factors = HashMap::new();
        factors.insert(NodeId::from("c"), 0.0);
        let ch = factory.create(2, 32, &nodes(&["a", "b", "c"]), &factors);

        assert!(ch.contains_member(&NodeId::from("c")));
        assert!(owned_segments(&ch, "c").is_empty());
    }

    #[test]
    fn test_update_members_keeps_surviving_owners() {
        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(1, 32, &nodes(&["a", "b"]), &HashMap::new());
        let updated = factory.update_members(&ch, &nodes(&["a"]), &HashMap::new());

        for segment in 0..32 {
            assert_eq!(updated.segment_owners(segment), &[NodeId::from("a")][..]);
        }
        assert_eq!(updated.members(), &nodes(&["a"])[..]);
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(2, 32, &nodes(&["a", "b"]), &HashMap::new());
        let joined = factory.update_members(&ch, &nodes(&["a", "b", "c"]), &HashMap::new());

        // The joiner owns nothing until a rebalance.
        assert!(owned_segments(&joined, "c").is_empty());

        let balanced = factory.rebalance(&joined);
        assert!(!owned_segments(&balanced, "c").is_empty());
        assert_eq!(factory.rebalance(&balanced), balanced);
    }

    #[test]
    fn test_union_orders_first_owners_first() {
        let factory = RingConsistentHashFactory::default();
        let old = factory.create(1, 8, &nodes(&["a"]), &HashMap::new());
        let new = factory.create(1, 8, &nodes(&["b"]), &HashMap::new());

        let union = factory.union(&new, &old);
        assert_eq!(union.members(), &nodes(&["b", "a"])[..]);
        for segment in 0..8 {
            assert_eq!(union.primary_owner(segment), Some(&NodeId::from("b")));
            assert_eq!(union.segment_owners(segment).len(), 2);
        }
    }

    #[test]
    fn test_remap_fails_on_unknown_member() {
        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(1, 4, &nodes(&["a", "b"]), &HashMap::new());

        let partial = ch.remap(|m| if m.as_str() == "a" { Some(1u32) } else { None });
        assert!(partial.is_none());

        let full = ch
            .remap(|m| Some(m.as_str().len() as u32 + if m.as_str() == "a" { 0 } else { 1 }))
            .unwrap();
        assert_eq!(full.members(), &[1, 2][..]);
    }
}
