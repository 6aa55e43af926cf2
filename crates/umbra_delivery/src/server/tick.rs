//! # Delivery Tick Schedule
//!
//! Paces [`DeliveryServer::run_for`](super::DeliveryServer::run_for). Each
//! tick drains worker completions and hands every session a fresh admission
//! budget, so the tick rate bounds how fast generation requests go out.
//!
//! When the control thread falls behind, at most [`MAX_CATCH_UP`] ticks are
//! replayed back to back; the rest are skipped and counted.

use std::time::{Duration, Instant};

use crate::config::DEFAULT_TICK_RATE;

/// Most ticks run back to back after a stall.
pub const MAX_CATCH_UP: u32 = 5;

/// Deadline-based tick schedule.
#[derive(Debug)]
pub struct TickLoop {
    period: Duration,
    next_due: Instant,
    stats: TickStats,
}

/// Tick timing, accumulated since the loop was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks run.
    pub ticks: u64,
    /// Time spent inside ticks, in µs.
    pub busy_us: u64,
    /// Longest tick, in µs.
    pub max_tick_us: u64,
    /// Ticks that took longer than one period.
    pub late_ticks: u64,
    /// Ticks dropped because the loop fell too far behind.
    pub skipped_ticks: u64,
}

impl TickStats {
    /// Mean tick duration in µs, zero before the first tick.
    #[must_use]
    pub fn avg_tick_us(&self) -> u64 {
        self.busy_us.checked_div(self.ticks).unwrap_or(0)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl TickLoop {
    /// Creates a schedule running `tick_rate` times per second. The first
    /// tick is due immediately.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / tick_rate.max(1),
            next_due: Instant::now(),
            stats: TickStats::default(),
        }
    }

    /// Sleeps until the next tick is due and returns how many ticks to run
    /// now, between 1 and [`MAX_CATCH_UP`].
    pub fn wait(&mut self) -> u32 {
        let now = Instant::now();
        if now < self.next_due {
            std::thread::sleep(self.next_due - now);
        }

        let now = Instant::now();
        let behind = now.saturating_duration_since(self.next_due);
        let owed = u32::try_from(behind.as_nanos() / self.period.as_nanos())
            .unwrap_or(u32::MAX)
            .saturating_add(1);

        if owed > MAX_CATCH_UP {
            self.stats.skipped_ticks += u64::from(owed - MAX_CATCH_UP);
            self.next_due = now + self.period;
            MAX_CATCH_UP
        } else {
            self.next_due += self.period * owed;
            owed
        }
    }

    /// Runs one tick and records how long it took.
    pub fn run_tick<R>(&mut self, tick: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let output = tick();
        let took = start.elapsed();

        let took_us = micros(took);
        self.stats.ticks += 1;
        self.stats.busy_us = self.stats.busy_us.saturating_add(took_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(took_us);
        if took > self.period {
            self.stats.late_ticks += 1;
        }
        output
    }

    /// Time between ticks.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Timing so far.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_RATE)
    }
}
