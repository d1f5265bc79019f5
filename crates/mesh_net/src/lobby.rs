//! Lobby membership
//!
//! Stand-in for the external peer-discovery service: it knows the host and
//! the current peer list, and raises join/leave events that a [`Peer`]
//! forwards to its session.
//!
//! [`Peer`]: crate::Peer

use mesh_core::PeerId;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Present,
    Departed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyEvent {
    Joined(PeerId),
    Left(PeerId),
}

/// Membership table
pub struct Lobby {
    host: PeerId,
    members: BTreeMap<PeerId, MemberState>,
    events: VecDeque<LobbyEvent>,
}

impl Lobby {
    /// A lobby whose first member is its host.
    pub fn new(host: PeerId) -> Self {
        let mut lobby = Self {
            host,
            members: BTreeMap::new(),
            events: VecDeque::new(),
        };
        lobby.join(host);
        lobby
    }

    pub fn host(&self) -> PeerId {
        self.host
    }

    /// Returns false if `peer` is already present.
    pub fn join(&mut self, peer: PeerId) -> bool {
        let previous = self.members.insert(peer, MemberState::Present);
        if previous == Some(MemberState::Present) {
            return false;
        }
        self.events.push_back(LobbyEvent::Joined(peer));
        true
    }

    pub fn leave(&mut self, peer: PeerId) -> bool {
        match self.members.get_mut(&peer) {
            Some(state) if *state == MemberState::Present => {
                *state = MemberState::Departed;
                self.events.push_back(LobbyEvent::Left(peer));
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, peer: PeerId) -> Option<MemberState> {
        self.members.get(&peer).copied()
    }

    /// Present members in id order.
    pub fn present_members(&self) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|(_, &state)| state == MemberState::Present)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<LobbyEvent> {
        self.events.drain(..).collect()
    }
}
