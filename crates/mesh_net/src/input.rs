//! Latest known input per peer

use crate::wire::PlayerInputData;
use mesh_core::PeerId;
use mesh_services::InputState;
use std::collections::HashMap;

/// Last-writer-wins table of player inputs.
///
/// Inputs travel on the reliable-ordered class, so arrival order per sender
/// is send order and the newest arrival is always the newest sample.
#[derive(Debug, Default, Clone)]
pub struct InputTable {
    latest: HashMap<PeerId, PlayerInputData>,
}

impl InputTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, data: PlayerInputData) {
        self.latest.insert(data.peer, data);
    }

    pub fn get(&self, peer: PeerId) -> Option<&PlayerInputData> {
        self.latest.get(&peer)
    }

    /// Input of `peer`, or the neutral input if nothing arrived yet.
    pub fn state_of(&self, peer: PeerId) -> InputState {
        self.latest
            .get(&peer)
            .map(|data| data.input)
            .unwrap_or_default()
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.latest.remove(&peer);
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::math::Vec2;

    fn sample(peer: u64, tick: u64, x: f32) -> PlayerInputData {
        PlayerInputData {
            peer: PeerId(peer),
            tick,
            input: InputState {
                movement: Vec2::new(x, 0.0),
                ..Default::default()
            },
        }
    }

    #[test]
    fn last_writer_wins_per_peer() {
        let mut table = InputTable::new();
        table.apply(sample(1, 10, 0.1));
        table.apply(sample(2, 10, 0.2));
        table.apply(sample(1, 11, 0.9));
        assert_eq!(table.len(), 2);
        assert_eq!(table.state_of(PeerId(1)).movement.x, 0.9);
        assert_eq!(table.get(PeerId(2)).map(|d| d.tick), Some(10));
    }

    #[test]
    fn unknown_peer_reads_neutral() {
        let table = InputTable::new();
        assert_eq!(table.state_of(PeerId(5)), InputState::default());
    }
}
