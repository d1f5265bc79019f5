//! Wire structs shared by every peer

use mesh_core::math::{Transform, Vec3};
use mesh_core::{ObjectId, PeerId};
use mesh_services::InputState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Selects the behavior and codec of a replicated object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectType(pub u16);

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Authoritative snapshot of one object at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdatePacket {
    pub object_id: ObjectId,
    pub object_type: ObjectType,
    pub tick: u64,
    pub sender: PeerId,
    pub payload: Vec<u8>,
}

/// Issued by an authority when it creates an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnCommand {
    pub id: ObjectId,
    pub authority: PeerId,
    pub object_type: ObjectType,
    pub transform: Transform,
    pub params: Vec<Value>,
}

/// Reliable object lifecycle commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectCommand {
    Spawn(SpawnCommand),
    Destroy { id: ObjectId },
}

/// Intent of one player, broadcast once per tick by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerInputData {
    pub peer: PeerId,
    pub tick: u64,
    pub input: InputState,
}

/// Loosely-typed parameter used by spawn commands and RPCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    U64(u64),
    F32(f32),
    Str(String),
    Bytes(Vec<u8>),
    Vec3(Vec3),
    Object(ObjectId),
    Peer(PeerId),
}

/// Declared shape of a [`Value`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    I64,
    U64,
    F32,
    Str,
    Bytes,
    Vec3,
    Object,
    Peer,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::I64(_) => ValueKind::I64,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Vec3(_) => ValueKind::Vec3,
            Value::Object(_) => ValueKind::Object,
            Value::Peer(_) => ValueKind::Peer,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_peer(&self) -> Option<PeerId> {
        match self {
            Value::Peer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Kinds of a parameter list, for signature checks and error messages.
pub fn kinds_of(values: &[Value]) -> Vec<ValueKind> {
    values.iter().map(Value::kind).collect()
}

/// Addressee of an RPC: a replicated object or a named, non-replicated node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcTarget {
    Object(ObjectId),
    Node(String),
}

impl fmt::Display for RpcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcTarget::Object(id) => write!(f, "{id}"),
            RpcTarget::Node(path) => write!(f, "node:{path}"),
        }
    }
}

/// One-way method invocation. There is no reply channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub target: RpcTarget,
    pub method: String,
    pub params: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn value_kinds_match_variants() {
        let values = vec![
            Value::U64(3),
            Value::Str("door".into()),
            Value::Vec3(Vec3::X),
            Value::Peer(PeerId(4)),
        ];
        assert_eq!(
            kinds_of(&values),
            vec![ValueKind::U64, ValueKind::Str, ValueKind::Vec3, ValueKind::Peer]
        );
        assert_eq!(values[0].as_u64(), Some(3));
        assert_eq!(values[0].as_str(), None);
    }

    #[test]
    fn spawn_command_keeps_params_in_order() {
        let cmd = ObjectCommand::Spawn(SpawnCommand {
            id: ObjectId(0xABCD),
            authority: PeerId(2),
            object_type: ObjectType(7),
            transform: Transform::from_translation(Vec3::new(1.0, 0.0, -4.0)),
            params: vec![Value::F32(0.5), Value::Bool(true)],
        });
        let decoded: ObjectCommand = decode(&encode(&cmd).unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }
}
