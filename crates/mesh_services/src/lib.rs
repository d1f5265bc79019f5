//! Mesh Services Layer
//!
//! Platform collaborators the replication core consumes through narrow
//! interfaces: settings, local input capture, and saved player profiles.

pub mod input;
pub mod save;
pub mod settings;

pub use input::{ActionFlags, InputState};
pub use save::{Profile, ProfileError, ProfileStore};
pub use settings::{LoopbackSettings, NetSettings, SessionSettings, Settings, SettingsError};
