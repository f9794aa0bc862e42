use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use super::window::SlidingWindow;

/// Error types for throttle operations
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("Throttle is closed")]
    Closed,
}

/// Configuration for the concurrency throttle
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Maximum number of requests holding a slot at once
    pub max_concurrent_requests: usize,

    /// Maximum admissions in any trailing second
    pub max_requests_per_second: f64,

    /// Maximum admissions in any trailing 100 ms
    pub burst_limit: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 50,
            max_requests_per_second: 100.0,
            burst_limit: 20,
        }
    }
}

/// Point-in-time view of throttle load
#[derive(Debug, Clone, Serialize)]
pub struct LoadSnapshot {
    pub concurrent_requests: usize,
    pub recent_requests_per_second: usize,
    pub rate_limit_utilization: f64,
    pub concurrency_utilization: f64,
    pub available_slots: usize,
    pub burst_capacity_remaining: usize,
}

/// A held concurrency slot; dropping it frees the slot
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
    waited: Duration,
}

impl ThrottlePermit {
    /// Time spent in the rate limiter and waiting for the slot
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Bounds in-flight work and enforces a sliding requests-per-second ceiling
pub struct ConcurrencyThrottle {
    config: ThrottleConfig,
    slots: Arc<Semaphore>,
    window: Mutex<SlidingWindow>,
    /// Serializes callers through the rate limiter in arrival order
    turnstile: tokio::sync::Mutex<()>,
}

impl ConcurrencyThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let window = SlidingWindow::new(config.max_requests_per_second, config.burst_limit);

        Self {
            config,
            slots,
            window: Mutex::new(window),
            turnstile: tokio::sync::Mutex::new(()),
        }
    }

    /// Rate-limit the caller, then take a concurrency slot
    ///
    /// The slot is released when the returned permit drops, including when
    /// the surrounding task is cancelled.
    pub async fn throttle(&self) -> Result<ThrottlePermit, ThrottleError> {
        let started = Instant::now();
        if self.slots.is_closed() {
            return Err(ThrottleError::Closed);
        }

        let admitted_at = self.admit().await;

        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Closed while waiting for a slot; the admission never happened
                self.window.lock().retract(admitted_at);
                return Err(ThrottleError::Closed);
            }
        };

        Ok(ThrottlePermit {
            _permit: permit,
            waited: started.elapsed(),
        })
    }

    /// Wait until the sliding window has room, then record the admission
    async fn admit(&self) -> Instant {
        let _turn = self.turnstile.lock().await;

        loop {
            let now = Instant::now();
            let delay = {
                let mut window = self.window.lock();
                let delay = window.delay_until_admit(now);
                if delay.is_none() {
                    window.record(now);
                }
                delay
            };

            match delay {
                None => return now,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Rate limit reached, delaying request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Current concurrency and rate-limit statistics
    pub fn get_current_load(&self) -> LoadSnapshot {
        let now = Instant::now();
        let (recent, burst) = {
            let window = self.window.lock();
            (window.recent(now), window.burst_count(now))
        };

        let max_concurrent = self.config.max_concurrent_requests;
        let available = self.slots.available_permits();
        let in_flight = max_concurrent.saturating_sub(available);

        LoadSnapshot {
            concurrent_requests: in_flight,
            recent_requests_per_second: recent,
            rate_limit_utilization: if self.config.max_requests_per_second > 0.0 {
                recent as f64 / self.config.max_requests_per_second
            } else {
                0.0
            },
            concurrency_utilization: if max_concurrent == 0 {
                0.0
            } else {
                in_flight as f64 / max_concurrent as f64
            },
            available_slots: available,
            burst_capacity_remaining: self.config.burst_limit.saturating_sub(burst),
        }
    }

    /// Refuse further admissions; permits already handed out stay valid
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}
