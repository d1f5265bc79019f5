//! Session wire messages: one code byte, then a bincode body.

use super::{PeerState, PlayerOptions, SessionError};
use crate::codec::{decode, encode_tagged, split_tagged, WireError};
use mesh_core::PeerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionCode {
    RequestConfig = 1,
    RequestProgression = 2,
    RequestPlayerOptions = 3,
    ResponseConfig = 11,
    ResponseProgression = 12,
    ResponsePlayerOptions = 13,
    CommandStartGame = 20,
    CommandSetOptions = 21,
    NotifyState = 30,
}

impl SessionCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => SessionCode::RequestConfig,
            2 => SessionCode::RequestProgression,
            3 => SessionCode::RequestPlayerOptions,
            11 => SessionCode::ResponseConfig,
            12 => SessionCode::ResponseProgression,
            13 => SessionCode::ResponsePlayerOptions,
            20 => SessionCode::CommandStartGame,
            21 => SessionCode::CommandSetOptions,
            30 => SessionCode::NotifyState,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionMessage {
    RequestConfig,
    RequestProgression,
    /// Ask for the options of `subject`.
    RequestPlayerOptions { subject: PeerId },
    ResponseConfig(Vec<u8>),
    ResponseProgression(Vec<u8>),
    /// `None` when the responder does not know them yet.
    ResponsePlayerOptions {
        subject: PeerId,
        options: Option<PlayerOptions>,
    },
    CommandStartGame,
    CommandSetOptions {
        subject: PeerId,
        options: PlayerOptions,
    },
    NotifyState(PeerState),
}

#[derive(Serialize, Deserialize)]
struct OptionsBody {
    subject: PeerId,
    options: Option<PlayerOptions>,
}

impl SessionMessage {
    pub fn code(&self) -> SessionCode {
        match self {
            SessionMessage::RequestConfig => SessionCode::RequestConfig,
            SessionMessage::RequestProgression => SessionCode::RequestProgression,
            SessionMessage::RequestPlayerOptions { .. } => SessionCode::RequestPlayerOptions,
            SessionMessage::ResponseConfig(_) => SessionCode::ResponseConfig,
            SessionMessage::ResponseProgression(_) => SessionCode::ResponseProgression,
            SessionMessage::ResponsePlayerOptions { .. } => SessionCode::ResponsePlayerOptions,
            SessionMessage::CommandStartGame => SessionCode::CommandStartGame,
            SessionMessage::CommandSetOptions { .. } => SessionCode::CommandSetOptions,
            SessionMessage::NotifyState(_) => SessionCode::NotifyState,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let code = self.code() as u8;
        match self {
            SessionMessage::RequestConfig
            | SessionMessage::RequestProgression
            | SessionMessage::CommandStartGame => encode_tagged(code, &()),
            SessionMessage::RequestPlayerOptions { subject } => encode_tagged(code, subject),
            SessionMessage::ResponseConfig(blob) | SessionMessage::ResponseProgression(blob) => {
                encode_tagged(code, blob)
            }
            SessionMessage::ResponsePlayerOptions { subject, options } => encode_tagged(
                code,
                &OptionsBody {
                    subject: *subject,
                    options: options.clone(),
                },
            ),
            SessionMessage::CommandSetOptions { subject, options } => {
                encode_tagged(code, &(*subject, options))
            }
            SessionMessage::NotifyState(state) => encode_tagged(code, state),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        let (byte, body) = split_tagged(bytes)?;
        let code = SessionCode::from_byte(byte).ok_or(SessionError::UnknownCode(byte))?;
        let message = match code {
            SessionCode::RequestConfig => {
                decode::<()>(body)?;
                SessionMessage::RequestConfig
            }
            SessionCode::RequestProgression => {
                decode::<()>(body)?;
                SessionMessage::RequestProgression
            }
            SessionCode::CommandStartGame => {
                decode::<()>(body)?;
                SessionMessage::CommandStartGame
            }
            SessionCode::RequestPlayerOptions => SessionMessage::RequestPlayerOptions {
                subject: decode(body)?,
            },
            SessionCode::ResponseConfig => SessionMessage::ResponseConfig(decode(body)?),
            SessionCode::ResponseProgression => SessionMessage::ResponseProgression(decode(body)?),
            SessionCode::ResponsePlayerOptions => {
                let OptionsBody { subject, options } = decode(body)?;
                SessionMessage::ResponsePlayerOptions { subject, options }
            }
            SessionCode::CommandSetOptions => {
                let (subject, options) = decode(body)?;
                SessionMessage::CommandSetOptions { subject, options }
            }
            SessionCode::NotifyState => SessionMessage::NotifyState(decode(body)?),
        };
        Ok(message)
    }
}
