//! Circuit breaker guarding the admission queue
//!
//! The breaker has two states:
//! - Closed: normal operation, enqueues are allowed
//! - Open: too many failures, enqueues are rejected
//!
//! There is no separate half-open state. Once `timeout` has passed since the
//! last recorded failure, the next admission check closes the breaker and
//! resets the failure count.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Downstream is failing - requests are rejected
    Open,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures needed to open the circuit
    pub failure_threshold: u32,

    /// How long the circuit stays open after the last failure
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Failure-counting circuit breaker with lazy reset
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    open_count: u64,
}

impl CircuitBreaker {
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            open_count: 0,
        }
    }

    /// Check whether an admission may proceed at `now`
    ///
    /// Returns the remaining cool-down when the circuit is open.
    pub fn check_request(&mut self, now: Instant) -> Result<(), Duration> {
        if self.state == CircuitState::Closed && self.failure_count >= self.config.failure_threshold {
            warn!(
                failure_count = self.failure_count,
                "Circuit transitioning from Closed to Open"
            );
            self.last_failure = Some(now);
            self.transition_to_open();
        }

        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(self.config.timeout);

            if elapsed < self.config.timeout {
                return Err(self.config.timeout - elapsed);
            }

            info!("Circuit breaker reset - service available");
            self.transition_to_closed();
        }

        Ok(())
    }

    /// Record a successful request
    pub fn record_success(&mut self) {
        self.failure_count = self.failure_count.saturating_sub(1);
        debug!(failure_count = self.failure_count, "Request succeeded");
    }

    /// Record a failed request
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);

        if self.state == CircuitState::Closed && self.failure_count >= self.config.failure_threshold {
            warn!(
                failure_count = self.failure_count,
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            );
            self.transition_to_open();
        } else {
            debug!(
                failure_count = self.failure_count,
                threshold = self.config.failure_threshold,
                state = self.state.name(),
                "Request failed"
            );
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open;
        self.open_count += 1;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Number of times the circuit has opened
    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}
