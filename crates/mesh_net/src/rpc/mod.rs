//! One-way remote procedure calls
//!
//! A call names a target (replicated object or named node) and a method. The
//! method table is keyed by the target's concrete type, populated at startup,
//! and consulted on both the calling and the receiving side. There is no
//! reply, acknowledgment, or retry: handlers must tolerate loss, duplication
//! and reordering.

mod dispatcher;
mod registry;

pub use dispatcher::{RpcDispatcher, RpcScope};
pub use registry::{CallerPolicy, RpcMode, RpcRegistry, RpcSpec};

use crate::codec::WireError;
use crate::transport::TransportError;
use crate::wire::{RpcTarget, Value, ValueKind};
use mesh_core::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no target {0}")]
    UnknownTarget(RpcTarget),
    #[error("{target} has no method '{method}'")]
    UnknownMethod { target: RpcTarget, method: String },
    #[error("'{method}' is declared {declared:?}, called {requested:?}")]
    ModeMismatch {
        method: String,
        declared: RpcMode,
        requested: RpcMode,
    },
    #[error("'{method}' expects {expected:?}, got {got:?}")]
    BadParams {
        method: String,
        expected: Vec<ValueKind>,
        got: Vec<ValueKind>,
    },
    #[error("'{method}' is authority-only and {sender} is not the authority")]
    CallerNotAuthority { method: String, sender: PeerId },
    #[error("'{method}' reached {local}, which is not the authority of its target")]
    Misrouted { method: String, local: PeerId },
    #[error("target of '{method}' has an unexpected type")]
    TargetType { method: String },
    #[error("handler failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A call queued by a handler, sent after the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutgoingCall {
    pub target: RpcTarget,
    pub method: String,
    pub params: Vec<Value>,
    pub mode: RpcMode,
}

/// Handed to every RPC handler.
#[derive(Debug)]
pub struct RpcContext {
    pub sender: PeerId,
    pub local_peer: PeerId,
    pub tick: u64,
    pub target: RpcTarget,
    outbox: Vec<OutgoingCall>,
}

impl RpcContext {
    pub(crate) fn new(sender: PeerId, local_peer: PeerId, tick: u64, target: RpcTarget) -> Self {
        Self {
            sender,
            local_peer,
            tick,
            target,
            outbox: Vec::new(),
        }
    }

    /// Whether the call originated on this peer.
    pub fn is_local(&self) -> bool {
        self.sender == self.local_peer
    }

    /// Queue a follow-up call. It is validated and sent once the current
    /// handler has returned.
    pub fn call(
        &mut self,
        target: RpcTarget,
        method: impl Into<String>,
        params: Vec<Value>,
        mode: RpcMode,
    ) {
        self.outbox.push(OutgoingCall {
            target,
            method: method.into(),
            params,
            mode,
        });
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<OutgoingCall> {
        std::mem::take(&mut self.outbox)
    }
}
