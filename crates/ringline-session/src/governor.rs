//! RateGovernor — byte budget for backfill traffic.
//!
//! Only backfill is ever throttled; the real-time stream always goes out
//! immediately. The budget adapts: low real-time send latency means the
//! pipe has headroom and the budget widens toward the ceiling, rising
//! latency shrinks it toward the floor. The floor is never zero, so a
//! congested link still drains gaps, just slowly.

use std::time::{Duration, Instant};

/// Budget accounting window.
const WINDOW: Duration = Duration::from_secs(1);

/// Real-time send latency below this is "headroom".
const LATENCY_LOW: Duration = Duration::from_millis(5);

/// Real-time send latency above this is "congested".
const LATENCY_HIGH: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct RateGovernor {
    floor_bps: u64,
    ceiling_bps: u64,
    budget_bps: u64,
    window_start: Instant,
    sent_in_window: u64,
}

impl RateGovernor {
    pub fn new(floor_bps: u64, ceiling_bps: u64) -> Self {
        let floor_bps = floor_bps.max(1);
        let ceiling_bps = ceiling_bps.max(floor_bps);
        Self {
            floor_bps,
            ceiling_bps,
            budget_bps: ceiling_bps,
            window_start: Instant::now(),
            sent_in_window: 0,
        }
    }

    pub fn budget_bps(&self) -> u64 {
        self.budget_bps
    }

    /// Account `bytes` of backfill and return how long to pause before
    /// sending them. Zero while the window budget holds.
    pub fn reserve(&mut self, bytes: u64) -> Duration {
        self.reserve_at(bytes, Instant::now())
    }

    fn reserve_at(&mut self, bytes: u64, now: Instant) -> Duration {
        // The window is anchored at the first send after a quiet period, not
        // at construction time.
        if self.sent_in_window == 0 || now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.sent_in_window = 0;
        }

        self.sent_in_window += bytes;
        if self.sent_in_window <= self.budget_bps {
            Duration::ZERO
        } else {
            // Over budget: wait out the rest of the window.
            WINDOW.saturating_sub(now.duration_since(self.window_start))
        }
    }

    /// Feed an observed real-time send latency into the budget.
    pub fn observe_latency(&mut self, latency: Duration) {
        if latency <= LATENCY_LOW {
            // Widen by 10%, capped at the ceiling.
            self.budget_bps = (self.budget_bps + self.budget_bps / 10 + 1).min(self.ceiling_bps);
        } else if latency >= LATENCY_HIGH {
            // Shrink by 25%, floored.
            self.budget_bps = (self.budget_bps - self.budget_bps / 4).max(self.floor_bps);
        }
    }
}
