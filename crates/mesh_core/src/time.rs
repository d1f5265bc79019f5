//! Deterministic time system
//!
//! Fixed-rate network ticks driven from variable-rate frames

use std::time::Duration;

/// Default simulation tick rate (60 Hz = 16.666ms per tick)
pub const TICK_RATE_HZ: u32 = 60;

/// Upper bound on ticks run for one frame, so a long stall cannot spiral.
pub const MAX_TICKS_PER_FRAME: u32 = 8;

/// Simulation time tracker
///
/// Frames feed wall-clock deltas in; whole ticks come out. The remainder stays
/// in the accumulator and is exposed as an interpolation factor.
pub struct SimulationTime {
    tick_duration: Duration,
    tick_count: u64,
    accumulated: Duration,
}

impl SimulationTime {
    pub fn new(tick_rate_hz: u32) -> Self {
        let hz = tick_rate_hz.max(1);
        Self {
            tick_duration: Duration::from_secs(1) / hz,
            tick_count: 0,
            accumulated: Duration::ZERO,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Tick length in seconds, the `delta` handed to tick hooks.
    pub fn tick_delta(&self) -> f32 {
        self.tick_duration.as_secs_f32()
    }

    /// Feed one frame's elapsed time and return how many ticks are due.
    pub fn advance(&mut self, frame_delta: Duration) -> u32 {
        self.accumulated += frame_delta;
        let mut due = 0;
        while self.accumulated >= self.tick_duration && due < MAX_TICKS_PER_FRAME {
            self.accumulated -= self.tick_duration;
            self.tick_count += 1;
            due += 1;
        }
        if due == MAX_TICKS_PER_FRAME {
            // drop the backlog instead of carrying it into the next frame
            self.accumulated = Duration::ZERO;
        }
        due
    }

    /// Fraction of the next tick already elapsed, in `[0, 1)`.
    pub fn alpha(&self) -> f32 {
        self.accumulated.as_secs_f32() / self.tick_duration.as_secs_f32()
    }

    pub fn total_time(&self) -> Duration {
        self.tick_duration * self.tick_count as u32
    }
}

impl Default for SimulationTime {
    fn default() -> Self {
        Self::new(TICK_RATE_HZ)
    }
}
