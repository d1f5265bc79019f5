//! Input abstraction for the local player

use mesh_core::math::Vec2;
use serde::{Deserialize, Serialize};

/// Bitset of held action buttons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionFlags(pub u32);

impl ActionFlags {
    pub const JUMP: ActionFlags = ActionFlags(1 << 0);
    pub const INTERACT: ActionFlags = ActionFlags(1 << 1);
    pub const PRIMARY: ActionFlags = ActionFlags(1 << 2);
    pub const SECONDARY: ActionFlags = ActionFlags(1 << 3);
    pub const CROUCH: ActionFlags = ActionFlags(1 << 4);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: ActionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ActionFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ActionFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ActionFlags {
    type Output = ActionFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ActionFlags(self.0 | rhs.0)
    }
}

/// Sampled intent of one player for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    pub movement: Vec2,
    pub look: Vec2,
    pub actions: ActionFlags,
}

impl InputState {
    /// Movement clamped to the unit circle.
    pub fn clamped(mut self) -> Self {
        if self.movement.length_squared() > 1.0 {
            self.movement = self.movement.normalize();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let mut flags = ActionFlags::JUMP | ActionFlags::PRIMARY;
        assert!(flags.contains(ActionFlags::JUMP));
        assert!(!flags.contains(ActionFlags::INTERACT));
        flags.remove(ActionFlags::JUMP);
        assert_eq!(flags, ActionFlags::PRIMARY);
    }

    #[test]
    fn diagonal_movement_is_clamped() {
        let input = InputState {
            movement: Vec2::new(1.0, 1.0),
            ..Default::default()
        }
        .clamped();
        assert!((input.movement.length() - 1.0).abs() < 1e-5);
    }
}
