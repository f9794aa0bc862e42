//! Sliding-window bookkeeping for the request rate limiter
//!
//! Admission timestamps from the trailing second are kept in arrival order.
//! Two limits are checked against the same window:
//! - at most `max_per_second` admissions in any trailing second
//! - at most `burst_limit` admissions in any trailing 100 ms

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Length of the rate window
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Length of the burst sub-window
pub const BURST_WINDOW: Duration = Duration::from_millis(100);

/// Admission timestamps from the trailing [`RATE_WINDOW`]
#[derive(Debug)]
pub struct SlidingWindow {
    stamps: VecDeque<Instant>,
    max_per_second: f64,
    burst_limit: usize,
}

impl SlidingWindow {
    pub fn new(max_per_second: f64, burst_limit: usize) -> Self {
        Self {
            stamps: VecDeque::new(),
            max_per_second,
            burst_limit: burst_limit.max(1),
        }
    }

    /// Drop timestamps that left the rate window
    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long a caller arriving at `now` must wait, or `None` if it may pass
    pub fn delay_until_admit(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);

        let mut delay = Duration::ZERO;

        if self.stamps.len() as f64 >= self.max_per_second {
            if let Some(oldest) = self.stamps.front() {
                delay = delay.max(RATE_WINDOW.saturating_sub(now.saturating_duration_since(*oldest)));
            }
        }

        let in_burst = self.burst_count(now);
        if in_burst >= self.burst_limit {
            let oldest_in_burst = self.stamps[self.stamps.len() - in_burst];
            delay = delay.max(BURST_WINDOW.saturating_sub(now.saturating_duration_since(oldest_in_burst)));
        }

        if delay.is_zero() {
            None
        } else {
            Some(delay)
        }
    }

    /// Record an admission
    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    /// Undo an admission recorded at `at` that did not go through
    pub fn retract(&mut self, at: Instant) {
        if let Some(pos) = self.stamps.iter().rposition(|t| *t == at) {
            self.stamps.remove(pos);
        }
    }

    /// Admissions within the trailing second
    pub fn recent(&self, now: Instant) -> usize {
        self.stamps
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < RATE_WINDOW)
            .count()
    }

    /// Admissions within the trailing burst window
    pub fn burst_count(&self, now: Instant) -> usize {
        self.stamps
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < BURST_WINDOW)
            .count()
    }

    pub fn burst_limit(&self) -> usize {
        self.burst_limit
    }
}
