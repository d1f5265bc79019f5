//! Mesh Metrics - replication counters and tick timing
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use mesh_metrics::{Stat, StatCounters, TickTimer};
//!
//! let mut stats = StatCounters::new();
//! stats.increment(Stat::UpdatesSent, 3);
//!
//! let mut timer = TickTimer::new(60, std::time::Duration::from_millis(16));
//! timer.begin();
//! // ... run one tick ...
//! timer.end();
//! println!("tick load: {:.0}%", timer.load() * 100.0);
//! ```
//!
//! In production builds (without `metrics` feature), all instrumentation
//! is compiled out to zero overhead.

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod ring_buffer;
#[cfg(feature = "metrics")]
mod tick_timer;

#[cfg(feature = "metrics")]
pub use counter::StatCounters;
#[cfg(feature = "metrics")]
pub use ring_buffer::RingBuffer;
#[cfg(feature = "metrics")]
pub use tick_timer::TickTimer;

/// Events counted by the replication core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    UpdatesSent,
    UpdatesApplied,
    UpdatesStale,
    Desyncs,
    SpawnsRejected,
    RpcsDispatched,
    RpcsDropped,
    SessionDropped,
    SendFailures,
}

impl Stat {
    pub const COUNT: usize = 9;

    pub const ALL: [Stat; Stat::COUNT] = [
        Stat::UpdatesSent,
        Stat::UpdatesApplied,
        Stat::UpdatesStale,
        Stat::Desyncs,
        Stat::SpawnsRejected,
        Stat::RpcsDispatched,
        Stat::RpcsDropped,
        Stat::SessionDropped,
        Stat::SendFailures,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stat::UpdatesSent => "updates_sent",
            Stat::UpdatesApplied => "updates_applied",
            Stat::UpdatesStale => "updates_stale",
            Stat::Desyncs => "desyncs",
            Stat::SpawnsRejected => "spawns_rejected",
            Stat::RpcsDispatched => "rpcs_dispatched",
            Stat::RpcsDropped => "rpcs_dropped",
            Stat::SessionDropped => "session_dropped",
            Stat::SendFailures => "send_failures",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default, Clone)]
pub struct StatCounters;

#[cfg(not(feature = "metrics"))]
impl StatCounters {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _stat: Stat, _value: u64) {}
    pub fn get(&self, _stat: Stat) -> u64 { 0 }
    pub fn merge(&mut self, _other: &StatCounters) {}
    pub fn reset_all(&mut self) {}
    pub fn iter(&self) -> impl Iterator<Item = (Stat, u64)> { std::iter::empty() }
}

#[cfg(not(feature = "metrics"))]
pub struct TickTimer;

#[cfg(not(feature = "metrics"))]
impl TickTimer {
    pub fn new(_capacity: usize, _budget: std::time::Duration) -> Self { Self }
    pub fn begin(&mut self) {}
    pub fn end(&mut self) {}
    pub fn average_ms(&self) -> f64 { 0.0 }
    pub fn worst_ms(&self) -> f64 { 0.0 }
    pub fn load(&self) -> f64 { 0.0 }
    pub fn overruns(&self) -> u64 { 0 }
}
