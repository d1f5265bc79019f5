//! Authority management
//!
//! Tracks which peer owns which objects, so a departing peer's objects can
//! be found without scanning the registry.

use mesh_core::{ObjectId, PeerId};
use std::collections::{BTreeSet, HashMap};

/// Authority assignment
#[derive(Debug, Default)]
pub struct AuthorityMap {
    owners: HashMap<ObjectId, PeerId>,
    by_peer: HashMap<PeerId, BTreeSet<ObjectId>>,
}

impl AuthorityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_authority(&self, object: ObjectId) -> Option<PeerId> {
        self.owners.get(&object).copied()
    }

    /// Record `peer` as the authority of `object`, replacing any previous owner.
    pub fn assign_authority(&mut self, object: ObjectId, peer: PeerId) {
        if let Some(previous) = self.owners.insert(object, peer) {
            self.detach(object, previous);
        }
        self.by_peer.entry(peer).or_default().insert(object);
    }

    pub fn release(&mut self, object: ObjectId) -> Option<PeerId> {
        let owner = self.owners.remove(&object)?;
        self.detach(object, owner);
        Some(owner)
    }

    /// Objects owned by `peer`, in id order.
    pub fn owned_by(&self, peer: PeerId) -> Vec<ObjectId> {
        self.by_peer
            .get(&peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn detach(&mut self, object: ObjectId, peer: PeerId) {
        if let Some(set) = self.by_peer.get_mut(&peer) {
            set.remove(&object);
            if set.is_empty() {
                self.by_peer.remove(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassignment_moves_ownership() {
        let mut map = AuthorityMap::new();
        map.assign_authority(ObjectId(1), PeerId(10));
        map.assign_authority(ObjectId(2), PeerId(10));
        map.assign_authority(ObjectId(1), PeerId(20));

        assert_eq!(map.get_authority(ObjectId(1)), Some(PeerId(20)));
        assert_eq!(map.owned_by(PeerId(10)), vec![ObjectId(2)]);
        assert_eq!(map.owned_by(PeerId(20)), vec![ObjectId(1)]);
    }

    #[test]
    fn release_forgets_owner() {
        let mut map = AuthorityMap::new();
        map.assign_authority(ObjectId(5), PeerId(1));
        assert_eq!(map.release(ObjectId(5)), Some(PeerId(1)));
        assert_eq!(map.release(ObjectId(5)), None);
        assert!(map.owned_by(PeerId(1)).is_empty());
    }
}
