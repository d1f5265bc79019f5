//! Session bootstrap
//!
//! Tracks every peer ever seen in the session, runs the request/response
//! handshake that collects config, progression and player options, and
//! drives the shared start of the simulation.

mod machine;
mod message;

pub use machine::SessionStateMachine;
pub use message::{SessionCode, SessionMessage};

use crate::codec::WireError;
use mesh_core::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one peer. Only ever moves forward.
///
/// The local peer steps through the chain one state at a time. Views of
/// remote peers may jump ahead, since a notice sent before we joined is
/// never repeated and the next one we hear can be several steps further on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerState {
    WaitingForInfo,
    PreGameOk,
    PreGameLoading,
    PreGameDoneLoading,
    InGameOk,
    InGameLoading,
    InGameDoneLoading,
}

impl PeerState {
    /// The state after this one, if any.
    pub fn next(self) -> Option<PeerState> {
        use PeerState::*;
        match self {
            WaitingForInfo => Some(PreGameOk),
            PreGameOk => Some(PreGameLoading),
            PreGameLoading => Some(PreGameDoneLoading),
            PreGameDoneLoading => Some(InGameOk),
            InGameOk => Some(InGameLoading),
            InGameLoading => Some(InGameDoneLoading),
            InGameDoneLoading => None,
        }
    }
}

/// Per-session options the authority assigns to each peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerOptions {
    /// Player slot, or `None` for a spectator.
    pub slot: Option<u32>,
    pub team: u8,
}

impl PlayerOptions {
    pub fn is_spectator(&self) -> bool {
        self.slot.is_none()
    }
}

/// Everything known about one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub progression: Option<Vec<u8>>,
    pub config: Option<Vec<u8>>,
    pub options: Option<PlayerOptions>,
    pub state: PeerState,
    pub removed: bool,
}

impl PeerRecord {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            progression: None,
            config: None,
            options: None,
            state: PeerState::WaitingForInfo,
            removed: false,
        }
    }

    /// Config, progression and options have all arrived.
    pub fn has_info(&self) -> bool {
        self.progression.is_some() && self.config.is_some() && self.options.is_some()
    }
}

/// Inputs of a [`SessionStateMachine`].
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local_peer: PeerId,
    /// Initial session authority, normally the lobby host.
    pub authority: PeerId,
    pub progression: Vec<u8>,
    pub config: Vec<u8>,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    NewPlayer(PeerId),
    PlayerRemoved(PeerId),
    /// A removed peer came back; its record starts over.
    PlayerRejoined(PeerId),
    OptionsChanged {
        peer: PeerId,
        options: PlayerOptions,
    },
    StateChanged {
        peer: PeerId,
        state: PeerState,
    },
    AuthorityChanged {
        previous: PeerId,
        current: PeerId,
    },
    SimulationStarted,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session message code {0}")]
    UnknownCode(u8),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("{0} is not part of the session")]
    UnknownPeer(PeerId),
    #[error("{sender} is not the session authority")]
    NotAuthority { sender: PeerId },
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: PeerState, to: PeerState },
}
