//! Tick cost against the fixed tick budget

use super::ring_buffer::RingBuffer;
use std::time::{Duration, Instant};

pub struct TickTimer {
    tick_start: Instant,
    budget: Duration,
    samples: RingBuffer<Duration>,
    overruns: u64,
}

impl TickTimer {
    pub fn new(capacity: usize, budget: Duration) -> Self {
        Self {
            tick_start: Instant::now(),
            budget,
            samples: RingBuffer::new(capacity),
            overruns: 0,
        }
    }

    pub fn begin(&mut self) {
        self.tick_start = Instant::now();
    }

    pub fn end(&mut self) {
        let elapsed = self.tick_start.elapsed();
        if elapsed > self.budget {
            self.overruns += 1;
        }
        self.samples.push(elapsed);
    }

    pub fn average_ms(&self) -> f64 {
        self.samples.average().as_secs_f64() * 1000.0
    }

    pub fn worst_ms(&self) -> f64 {
        self.samples.max().as_secs_f64() * 1000.0
    }

    /// Average tick cost as a fraction of the budget.
    pub fn load(&self) -> f64 {
        if self.budget.is_zero() {
            return 0.0;
        }
        self.samples.average().as_secs_f64() / self.budget.as_secs_f64()
    }

    /// Ticks that ran longer than the budget.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}
