//! Mesh Core
//!
//! Contains the fundamental simulation building blocks shared by every crate:
//! - Peer and object identity
//! - Deterministic fixed-rate time
//! - Deterministic math and random numbers

pub mod id;
pub mod math;
pub mod time;

pub use glam;
pub use id::{ObjectId, PeerId};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
