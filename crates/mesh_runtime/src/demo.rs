//! Demo content: a steerable drone and a shared scoreboard node.

use mesh_core::math::Vec3;
use mesh_net::codec::{decode, encode};
use mesh_net::{
    behavior_any, Behavior, CallerPolicy, ObjectCtx, ObjectType, ObjectTypeRegistry, RegistryError,
    RpcError, RpcMode, RpcRegistry, RpcSpec, RpcTarget, TypeSpec, Value, ValueKind, WireError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DRONE: ObjectType = ObjectType(1);
pub const SCOREBOARD: &str = "scoreboard";

const DRONE_SPEED: f32 = 4.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct DroneState {
    position: Vec3,
    velocity: Vec3,
}

/// Steered by its owner's input; replicas extrapolate between updates.
#[derive(Debug, Default)]
pub struct Drone {
    state: DroneState,
}

impl Drone {
    pub fn position(&self) -> Vec3 {
        self.state.position
    }
}

impl Behavior for Drone {
    fn authority_tick(&mut self, ctx: &mut ObjectCtx<'_>) {
        let input = ctx.input_of(ctx.authority);
        let velocity = Vec3::new(input.movement.x, 0.0, input.movement.y) * DRONE_SPEED;
        let moving = velocity.length_squared() > 0.0;
        ctx.set_sleeping(!moving && self.state.velocity == Vec3::ZERO);
        if moving || self.state.velocity != velocity {
            ctx.mark_dirty();
        }
        self.state.velocity = velocity;
        self.state.position += velocity * ctx.delta;
    }

    fn predict_tick(&mut self, ctx: &mut ObjectCtx<'_>) {
        self.state.position += self.state.velocity * ctx.delta;
    }

    fn write_state(&self) -> Result<Vec<u8>, WireError> {
        encode(&self.state)
    }

    fn read_state(&mut self, payload: &[u8]) -> Result<(), WireError> {
        self.state = decode(payload)?;
        Ok(())
    }

    behavior_any!();
}

/// Tag counts, kept by the session authority and announced to everyone.
#[derive(Debug, Default)]
pub struct Scoreboard {
    pub tags: BTreeMap<u64, u64>,
    pub last_announcement: Option<String>,
}

pub fn object_types() -> Result<ObjectTypeRegistry, RegistryError> {
    let mut types = ObjectTypeRegistry::new();
    types.register(DRONE, TypeSpec::new("drone", 2.0).predicted(), |args| {
        Ok(Box::new(Drone {
            state: DroneState {
                position: args.transform.translation,
                velocity: Vec3::ZERO,
            },
        }))
    })?;
    Ok(types)
}

pub fn rpc_methods() -> Result<RpcRegistry, RegistryError> {
    let mut rpc = RpcRegistry::new();

    rpc.register_node_method::<Scoreboard, _>(
        RpcSpec::new("tag", RpcMode::ToAuthorityOnly).params([ValueKind::Peer]),
        |board, params, ctx| {
            let victim = params[0]
                .as_peer()
                .ok_or_else(|| RpcError::Handler("tag needs a peer".into()))?;
            let score = board.tags.entry(ctx.sender.to_bits()).or_default();
            *score += 1;
            let line = format!("{} tagged {} (total {})", ctx.sender, victim, score);
            ctx.call(
                RpcTarget::Node(SCOREBOARD.into()),
                "announce",
                vec![Value::Str(line)],
                RpcMode::ToAllPeers,
            );
            Ok(())
        },
    )?;

    rpc.register_node_method::<Scoreboard, _>(
        RpcSpec::new("announce", RpcMode::ToAllPeers)
            .caller(CallerPolicy::AuthorityOnly)
            .params([ValueKind::Str]),
        |board, params, ctx| {
            let line = params[0].as_str().unwrap_or_default().to_string();
            tracing::info!(peer = %ctx.local_peer, "{line}");
            board.last_announcement = Some(line);
            Ok(())
        },
    )?;

    Ok(rpc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_build() {
        let types = object_types().unwrap();
        assert!(types.contains(DRONE));
        let rpc = rpc_methods().unwrap();
        assert_eq!(rpc.len(), 2);
    }

    #[test]
    fn drone_state_round_trips() {
        let mut drone = Drone::default();
        drone.state.position = Vec3::new(1.0, 0.0, 2.0);
        let bytes = drone.write_state().unwrap();
        let mut replica = Drone::default();
        replica.read_state(&bytes).unwrap();
        assert_eq!(replica.position(), Vec3::new(1.0, 0.0, 2.0));
    }
}
