//! Peer and object identity
//!
//! Both identities are opaque 64-bit handles. Zero is reserved as "none" and
//! is never a valid peer or object on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a session member, assigned by the lobby.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The reserved "no peer" value.
    pub const NONE: PeerId = PeerId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{:x}", self.0)
    }
}

/// Identity of a replicated simulation object, unique per simulation instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The reserved "no object" value. Spawns carrying it are rejected.
    pub const NONE: ObjectId = ObjectId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_reserved() {
        assert!(PeerId::NONE.is_none());
        assert!(ObjectId(0).is_none());
        assert!(!ObjectId(7).is_none());
    }

    #[test]
    fn peers_order_by_raw_value() {
        let mut peers = vec![PeerId(9), PeerId(2), PeerId(5)];
        peers.sort();
        assert_eq!(peers, vec![PeerId(2), PeerId(5), PeerId(9)]);
    }
}
