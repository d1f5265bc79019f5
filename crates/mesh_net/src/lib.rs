//! Mesh Network Layer
//!
//! Peer-to-peer, authority-based state replication. Every peer simulates the
//! objects it has authority over and streams their state to the others under
//! a fixed per-tick budget; everything else arrives as state updates, spawn
//! and destroy commands, inputs, and one-way RPCs.
//!
//! ## Architecture
//!
//! - [`transport`]: tagged datagrams over an external peer messenger
//! - [`codec`] / [`wire`]: compact binary payloads
//! - [`replication`]: object registry, tick/frame passes, priority scheduling
//! - [`rpc`]: named method dispatch with per-method authority policy
//! - [`session`]: peer bootstrap handshake and lifecycle events
//! - [`peer`]: one simulation participant wiring the above together

pub mod authority;
pub mod codec;
pub mod input;
pub mod lobby;
pub mod loopback;
pub mod object;
pub mod peer;
pub mod registration_error;
pub mod replication;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod wire;

pub use codec::WireError;
pub use input::InputTable;
pub use lobby::{Lobby, LobbyEvent, MemberState};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use object::{Behavior, ObjectCtx, ObjectTypeRegistry, SimObject, SpawnArgs, TypeSpec};
pub use peer::{Peer, PeerContext};
pub use registration_error::RegistryError;
pub use replication::{
    DestroyError, ReplicationScheduler, SchedulerConfig, SpawnError, Tick, TickReport, UpdateError,
};
pub use rpc::{
    CallerPolicy, RpcContext, RpcDispatcher, RpcError, RpcMode, RpcRegistry, RpcScope, RpcSpec,
};
pub use session::{
    PeerRecord, PeerState, PlayerOptions, SessionCode, SessionContext, SessionError, SessionEvent,
    SessionMessage, SessionStateMachine,
};
pub use transport::{Inbound, MessageClass, MessageKind, Transport, TransportAdapter, TransportError};
pub use wire::{ObjectType, RpcEnvelope, RpcTarget, StateUpdatePacket, Value, ValueKind};

pub use mesh_core::{ObjectId, PeerId};

/// Network protocol version
pub const PROTOCOL_VERSION: u32 = 1;
