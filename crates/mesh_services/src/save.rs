//! Saved player profiles
//!
//! The session handshake needs the local player's progression and config
//! before it can announce itself. Both are opaque blobs here; the gameplay
//! layer decides what they contain.

use mesh_core::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile store {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed profile store: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Progression and config blobs for one peer identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub progression: Vec<u8>,
    pub config: Vec<u8>,
}

/// Profiles keyed by raw peer identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileStore {
    profiles: HashMap<u64, Profile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ProfileError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn insert(&mut self, peer: PeerId, profile: Profile) {
        self.profiles.insert(peer.to_bits(), profile);
    }

    /// Profile for `peer`, or an empty one if nothing was saved yet.
    pub fn profile_for(&self, peer: PeerId) -> Profile {
        match self.profiles.get(&peer.to_bits()) {
            Some(profile) => profile.clone(),
            None => {
                tracing::debug!(peer = %peer, "no saved profile, using empty one");
                Profile::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_profile_is_empty() {
        let store = ProfileStore::new();
        assert_eq!(store.profile_for(PeerId(3)), Profile::default());
    }

    #[test]
    fn store_survives_json() {
        let mut store = ProfileStore::new();
        store.insert(
            PeerId(3),
            Profile {
                progression: vec![1, 2, 3],
                config: b"fov=90".to_vec(),
            },
        );
        let text = store.to_json_string().unwrap();
        let loaded = ProfileStore::from_json_str(&text).unwrap();
        assert_eq!(loaded.profile_for(PeerId(3)).progression, vec![1, 2, 3]);
    }
}
