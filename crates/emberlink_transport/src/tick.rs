//! # Tick Loop
//!
//! Fixed-timestep controller for hosts that do not already own a
//! scheduler. The transport itself never blocks; this loop only decides
//! *when* to call the per-tick processing step.

use std::time::{Duration, Instant};

/// Default processing rate: one tick per 33 ms frame budget.
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    /// Minimum tick duration observed.
    pub min_tick_us: u64,
    /// Maximum tick duration observed.
    pub max_tick_us: u64,
    /// Rolling average tick duration.
    pub avg_tick_us: u64,
    /// Ticks that overran their budget.
    pub late_ticks: u64,
    /// Total ticks measured.
    pub total_ticks: u64,
}

/// Accumulator-based fixed-timestep loop.
///
/// Ensures a consistent tick rate regardless of per-tick processing time.
pub struct TickLoop {
    tick_duration: Duration,
    last_tick: Instant,
    accumulator: Duration,
    tick_count: u64,
    stats: TickStats,
}

impl TickLoop {
    /// Creates a loop at the given rate.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        let tick_duration = Duration::from_micros(1_000_000 / u64::from(tick_rate.max(1)));
        Self {
            tick_duration,
            last_tick: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
            stats: TickStats {
                min_tick_us: u64::MAX,
                avg_tick_us: tick_duration.as_micros() as u64,
                ..TickStats::default()
            },
        }
    }

    /// Returns true if a tick is due.
    ///
    /// Call in a loop until it returns false.
    #[must_use]
    pub fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_tick);
        self.last_tick = now;
        self.accumulator >= self.tick_duration
    }

    /// Marks the start of a tick and returns its start time.
    #[must_use]
    pub fn begin_tick(&mut self) -> Instant {
        self.accumulator = self.accumulator.saturating_sub(self.tick_duration);
        self.tick_count += 1;
        Instant::now()
    }

    /// Marks the end of a tick, recording timing statistics.
    pub fn end_tick(&mut self, start: Instant) {
        let duration_us = start.elapsed().as_micros() as u64;
        self.stats.total_ticks += 1;
        self.stats.min_tick_us = self.stats.min_tick_us.min(duration_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);
        self.stats.avg_tick_us = (self.stats.avg_tick_us * 15 + duration_us) / 16;
        if Duration::from_micros(duration_us) > self.tick_duration {
            self.stats.late_ticks += 1;
        }
    }

    /// Sleeps until the next tick is due.
    pub fn wait_for_next_tick(&self) {
        let elapsed = Instant::now().duration_since(self.last_tick);
        if elapsed < self.tick_duration {
            let remaining = self.tick_duration - elapsed;
            if remaining > Duration::from_micros(1000) {
                std::thread::sleep(remaining - Duration::from_micros(500));
            }
            while Instant::now().duration_since(self.last_tick) < self.tick_duration {
                std::hint::spin_loop();
            }
        }
    }

    /// Ticks executed so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Timing statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Target tick duration.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration() {
        let tick_loop = TickLoop::new(30);
        assert_eq!(tick_loop.tick_duration(), Duration::from_micros(33_333));
        assert_eq!(tick_loop.tick_count(), 0);
    }

    #[test]
    fn test_tick_execution() {
        let mut tick_loop = TickLoop::new(1000);
        std::thread::sleep(Duration::from_millis(5));
        assert!(tick_loop.should_tick());

        let start = tick_loop.begin_tick();
        tick_loop.end_tick(start);
        assert_eq!(tick_loop.tick_count(), 1);
        assert_eq!(tick_loop.stats().total_ticks, 1);
    }
}
