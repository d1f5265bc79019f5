//! Settings management

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub net: NetSettings,
    pub session: SessionSettings,
    pub loopback: LoopbackSettings,
}

/// Replication and transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    pub tick_rate_hz: u32,
    /// Per-tick cap on state updates sent by one peer.
    pub num_updates_per_frame: usize,
    /// Updates older than this many ticks are discarded on arrival.
    pub freshness_threshold_ticks: u64,
    /// Spawn a default instance when an update names an unknown object.
    pub heal_unknown_objects: bool,
    pub max_inbound_per_poll: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_players: u32,
}

/// Link conditioning for the in-memory transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackSettings {
    pub unreliable_drop_rate: f32,
    pub seed: u64,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            num_updates_per_frame: 20,
            freshness_threshold_ticks: 60,
            heal_unknown_objects: false,
            max_inbound_per_poll: 1024,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { max_players: 8 }
    }
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            unreliable_drop_rate: 0.0,
            seed: 1,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.net.tick_rate_hz == 0 {
            return Err(SettingsError::Invalid {
                field: "net.tick_rate_hz",
                reason: "must be positive".to_string(),
            });
        }
        if self.session.max_players == 0 {
            return Err(SettingsError::Invalid {
                field: "session.max_players",
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.loopback.unreliable_drop_rate) {
            return Err(SettingsError::Invalid {
                field: "loopback.unreliable_drop_rate",
                reason: format!("{} is outside [0, 1]", self.loopback.unreliable_drop_rate),
            });
        }
        Ok(())
    }
}
