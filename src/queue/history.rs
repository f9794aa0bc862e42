use std::collections::VecDeque;
use std::time::Duration;

/// Number of response times kept for percentile estimation
pub const HISTORY_CAPACITY: usize = 100;

/// Weight of the newest sample in the success rate average
const SUCCESS_RATE_ALPHA: f64 = 0.05;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Recent response times and a smoothed success rate
#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    latencies: VecDeque<Duration>,
    success_rate: f64,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self {
            latencies: VecDeque::with_capacity(HISTORY_CAPACITY),
            success_rate: 1.0,
        }
    }
}

impl PerformanceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration, success: bool) {
        if self.latencies.len() == HISTORY_CAPACITY {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate + SUCCESS_RATE_ALPHA * sample;
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    pub fn len(&self) -> usize {
        self.latencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latencies.is_empty()
    }

    /// Mean of the recorded response times, zero when empty
    ///
    /// Summed in floating point seconds; saturates at `Duration::MAX`.
    pub fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: f64 = self.latencies.iter().map(Duration::as_secs_f64).sum();
        Duration::try_from_secs_f64(total / self.latencies.len() as f64).unwrap_or(Duration::MAX)
    }

    /// 95th percentile response time
    pub fn p95(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();

        let index = ((0.95 * sorted.len() as f64) as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    /// Timeout derived from the p95 latency and the success rate
    ///
    /// The p95 is padded by 1.5x, or 2x when the success rate drops below
    /// 90%, then clamped to [`MIN_TIMEOUT`, `MAX_TIMEOUT`].
    pub fn adaptive_timeout(&self) -> Duration {
        let Some(p95) = self.p95() else {
            return DEFAULT_TIMEOUT;
        };

        let multiplier = if self.success_rate < 0.9 { 2.0 } else { 1.5 };
        let secs = (p95.as_secs_f64() * multiplier)
            .clamp(MIN_TIMEOUT.as_secs_f64(), MAX_TIMEOUT.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_without_history() {
        let history = PerformanceHistory::new();
        assert_eq!(history.adaptive_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(history.success_rate(), 1.0);
        assert_eq!(history.average_latency(), Duration::ZERO);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = PerformanceHistory::new();
        for i in 0..250 {
            history.record(Duration::from_millis(i), true);
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Only 150..250 remain
        assert_eq!(history.p95(), Some(Duration::from_millis(245)));
    }

    #[test]
    fn test_p95_index_clamps_to_last() {
        let mut history = PerformanceHistory::new();
        history.record(Duration::from_secs(7), true);
        assert_eq!(history.p95(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_adaptive_timeout_uses_healthy_multiplier() {
        let mut history = PerformanceHistory::new();
        for _ in 0..20 {
            history.record(Duration::from_secs(10), true);
        }
        assert_eq!(history.adaptive_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_adaptive_timeout_doubles_on_low_success_rate() {
        let mut history = PerformanceHistory::new();
        for _ in 0..5 {
            history.record(Duration::from_secs(10), false);
        }
        assert!(history.success_rate() < 0.9);
        assert_eq!(history.adaptive_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_adaptive_timeout_is_clamped() {
        let mut fast = PerformanceHistory::new();
        fast.record(Duration::from_millis(10), true);
        assert_eq!(fast.adaptive_timeout(), MIN_TIMEOUT);

        let mut slow = PerformanceHistory::new();
        slow.record(Duration::from_secs(500), false);
        assert_eq!(slow.adaptive_timeout(), MAX_TIMEOUT);
    }

    #[test]
    fn test_huge_latencies_saturate() {
        let mut history = PerformanceHistory::new();
        history.record(Duration::MAX, true);
        history.record(Duration::MAX, false);

        assert_eq!(history.average_latency(), Duration::MAX);
        assert_eq!(history.adaptive_timeout(), MAX_TIMEOUT);
    }

    #[test]
    fn test_average_latency() {
        let mut history = PerformanceHistory::new();
        history.record(Duration::from_millis(100), true);
        history.record(Duration::from_millis(300), true);

        let avg = history.average_latency();
        assert!(avg > Duration::from_millis(199) && avg < Duration::from_millis(201));
    }

    #[test]
    fn test_success_rate_moving_average() {
        let mut history = PerformanceHistory::new();
        history.record(Duration::from_millis(5), false);
        assert!((history.success_rate() - 0.95).abs() < 1e-12);
        history.record(Duration::from_millis(5), true);
        assert!((history.success_rate() - (0.95 * 0.95 + 0.05)).abs() < 1e-12);
    }
}
