//! Transport adapter
//!
//! The point-to-point messenger is external. This module defines the narrow
//! interface the core consumes and the adapter that prefixes every datagram
//! with a one-byte [`MessageKind`] and strips it again on the way in.

use mesh_core::PeerId;
use mesh_metrics::{Stat, StatCounters};
use thiserror::Error;

/// Delivery class requested from the messenger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Unreliable,
    /// Unreliable and flushed immediately instead of being batched.
    UnreliableNoDelay,
    ReliableOrdered,
}

impl MessageClass {
    pub fn is_reliable(self) -> bool {
        matches!(self, MessageClass::ReliableOrdered)
    }
}

/// Leading discriminator byte of every datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Session = 0,
    Rpc = 1,
    StateUpdate = 2,
    Input = 3,
    DebugText = 4,
    ObjectCommand = 5,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageKind::Session),
            1 => Some(MessageKind::Rpc),
            2 => Some(MessageKind::StateUpdate),
            3 => Some(MessageKind::Input),
            4 => Some(MessageKind::DebugText),
            5 => Some(MessageKind::ObjectCommand),
            _ => None,
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{0} is not reachable")]
    Unreachable(PeerId),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("transport is closed")]
    Closed,
}

/// External peer messenger.
///
/// Implementations must be non-blocking: `send` enqueues, `drain_inbound`
/// returns whatever has arrived since the last call.
pub trait Transport: Send {
    fn local_peer(&self) -> PeerId;

    fn send(&mut self, bytes: &[u8], class: MessageClass, peer: PeerId)
        -> Result<(), TransportError>;

    fn broadcast(
        &mut self,
        bytes: &[u8],
        class: MessageClass,
        peers: &[PeerId],
    ) -> Vec<Result<(), TransportError>> {
        peers
            .iter()
            .map(|&peer| self.send(bytes, class, peer))
            .collect()
    }

    fn drain_inbound(&mut self, max_count: usize) -> Vec<(Vec<u8>, PeerId)>;
}

/// One demultiplexed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub sender: PeerId,
}

/// Frames outgoing payloads with their kind and demultiplexes incoming ones.
pub struct TransportAdapter {
    transport: Box<dyn Transport>,
    local_peer: PeerId,
    stats: StatCounters,
}

impl TransportAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let local_peer = transport.local_peer();
        Self {
            transport,
            local_peer,
            stats: StatCounters::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(kind.as_byte());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Send one payload. Failures are logged and counted, never retried.
    pub fn send(
        &mut self,
        kind: MessageKind,
        payload: &[u8],
        class: MessageClass,
        peer: PeerId,
    ) -> Result<(), TransportError> {
        let bytes = Self::frame(kind, payload);
        let result = self.transport.send(&bytes, class, peer);
        if let Err(err) = &result {
            tracing::warn!(peer = %peer, ?kind, error = %err, "send failed");
            self.stats.increment(Stat::SendFailures, 1);
        }
        result
    }

    /// Send one payload to every listed peer except the local one. Returns
    /// how many sends the messenger accepted.
    pub fn broadcast(
        &mut self,
        kind: MessageKind,
        payload: &[u8],
        class: MessageClass,
        peers: &[PeerId],
    ) -> usize {
        let targets: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|&peer| peer != self.local_peer)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let bytes = Self::frame(kind, payload);
        let results = self.transport.broadcast(&bytes, class, &targets);
        let mut delivered = 0;
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(peer = %peer, ?kind, error = %err, "broadcast send failed");
                    self.stats.increment(Stat::SendFailures, 1);
                }
            }
        }
        delivered
    }

    /// Drain up to `max_count` datagrams and strip their kind byte. Empty
    /// datagrams and unknown kinds are dropped.
    pub fn drain(&mut self, max_count: usize) -> Vec<Inbound> {
        let raw = self.transport.drain_inbound(max_count);
        let mut inbound = Vec::with_capacity(raw.len());
        for (mut bytes, sender) in raw {
            let Some(&first) = bytes.first() else {
                tracing::warn!(peer = %sender, "dropping empty datagram");
                continue;
            };
            let Some(kind) = MessageKind::from_byte(first) else {
                tracing::warn!(peer = %sender, kind = first, "dropping datagram of unknown kind");
                continue;
            };
            bytes.remove(0);
            inbound.push(Inbound {
                kind,
                payload: bytes,
                sender,
            });
        }
        inbound
    }

    pub fn stats(&self) -> &StatCounters {
        &self.stats
    }
}
