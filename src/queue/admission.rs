//! Multi-level priority queue with circuit breaking and adaptive timeouts
//!
//! Requests are admitted into one of `priority_levels` bounded FIFO queues.
//! Level 0 is the highest priority and is always drained first. Every level
//! holds `max_queue_size / priority_levels` requests; a full level rejects
//! new requests immediately instead of blocking or dropping them.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::history::PerformanceHistory;

/// Why a request was refused at the door
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The circuit breaker is open; retry after the remaining cool-down
    CircuitOpen { retry_in: Duration },

    /// The queue for this priority level is at capacity
    QueueFull { priority: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitOpen { retry_in } => write!(
                f,
                "circuit breaker is open, service temporarily unavailable (retry in {:?})",
                retry_in
            ),
            RejectReason::QueueFull { priority } => {
                write!(f, "request queue full for priority level {}", priority)
            }
        }
    }
}

/// Error types for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Request rejected: {reason}")]
    Rejected { reason: RejectReason },
}

impl QueueError {
    pub fn reason(&self) -> &RejectReason {
        match self {
            QueueError::Rejected { reason } => reason,
        }
    }
}

/// Configuration for the admission queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total capacity, split evenly across priority levels
    pub max_queue_size: usize,

    /// Number of priority levels (0 is highest)
    pub priority_levels: usize,

    /// Failures needed to open the circuit breaker
    pub circuit_breaker_threshold: u32,

    /// How long the breaker stays open after the last failure
    pub circuit_breaker_timeout: Duration,

    /// Derive a timeout from recent latencies when the caller gives none
    pub adaptive_timeout: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            priority_levels: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            adaptive_timeout: true,
        }
    }
}

/// Unique request identifier, `req_<unix micros>_<sequence>_<priority>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A queued request and its admission metadata
#[derive(Debug, Clone)]
pub struct RequestItem<P> {
    pub id: RequestId,
    pub payload: P,
    pub priority: usize,
    /// Execution deadline; `None` when no timeout was given and adaptive timeouts are off
    pub timeout: Option<Duration>,
    pub enqueued_at: Instant,
    pub retries: u32,
}

/// Statistics for the admission queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_queued_requests: usize,
    pub priority_queue_sizes: Vec<usize>,
    pub queue_utilization: f64,
    pub circuit_state: CircuitState,
    pub circuit_breaker_failures: u32,
    pub circuit_open_count: u64,
    pub success_rate: f64,
    /// Mean of the recent response times, in seconds
    pub avg_response_time: f64,
    /// Timeout a request without an explicit one would get, in seconds
    pub adaptive_timeout: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub rejected_queue_full: u64,
    pub rejected_circuit_open: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: u64,
    dequeued: u64,
    rejected_queue_full: u64,
    rejected_circuit_open: u64,
}

/// Everything guarded by the queue lock
struct QueueState<P> {
    levels: Vec<VecDeque<RequestItem<P>>>,
    breaker: CircuitBreaker,
    history: PerformanceHistory,
    counters: QueueCounters,
}

/// Priority admission queue with circuit breaker protection
pub struct AdmissionQueue<P> {
    config: QueueConfig,
    level_capacity: usize,
    state: Mutex<QueueState<P>>,
    available: Notify,
    sequence: AtomicU64,
}

impl<P> AdmissionQueue<P> {
    pub fn new(mut config: QueueConfig) -> Self {
        config.priority_levels = config.priority_levels.max(1);
        let level_capacity = config.max_queue_size / config.priority_levels;

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            timeout: config.circuit_breaker_timeout,
        });

        let levels = (0..config.priority_levels)
            .map(|_| VecDeque::with_capacity(level_capacity))
            .collect();

        info!(
            priority_levels = config.priority_levels,
            level_capacity = level_capacity,
            "Admission queue initialized"
        );

        Self {
            config,
            level_capacity,
            state: Mutex::new(QueueState {
                levels,
                breaker,
                history: PerformanceHistory::new(),
                counters: QueueCounters::default(),
            }),
            available: Notify::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Admit a request at `priority` (clamped to the configured levels)
    ///
    /// Rejects immediately when the circuit breaker is open or the level is
    /// full. Without an explicit `timeout`, an adaptive one is attached when
    /// enabled.
    pub fn enqueue(&self, payload: P, priority: i32, timeout: Option<Duration>) -> Result<RequestId, QueueError> {
        let now = Instant::now();
        let priority = (priority.max(0) as usize).min(self.config.priority_levels - 1);

        let mut state = self.state.lock();

        if let Err(retry_in) = state.breaker.check_request(now) {
            state.counters.rejected_circuit_open += 1;
            debug!(priority = priority, "Circuit breaker open, rejecting request");
            return Err(QueueError::Rejected {
                reason: RejectReason::CircuitOpen { retry_in },
            });
        }

        let id = self.next_id(priority);
        if state.levels[priority].len() >= self.level_capacity {
            state.counters.rejected_queue_full += 1;
            warn!(priority = priority, request_id = %id, "Queue full, rejecting request");
            return Err(QueueError::Rejected {
                reason: RejectReason::QueueFull { priority },
            });
        }

        let timeout = match timeout {
            Some(timeout) => Some(timeout),
            None if self.config.adaptive_timeout => Some(state.history.adaptive_timeout()),
            None => None,
        };

        state.levels[priority].push_back(RequestItem {
            id: id.clone(),
            payload,
            priority,
            timeout,
            enqueued_at: now,
            retries: 0,
        });
        state.counters.enqueued += 1;
        drop(state);

        debug!(request_id = %id, priority = priority, "Enqueued request");
        self.available.notify_one();
        Ok(id)
    }

    /// Pop the oldest request from the highest non-empty priority level
    pub fn dequeue(&self) -> Option<RequestItem<P>> {
        let mut state = self.state.lock();
        let item = state.levels.iter_mut().find_map(|level| level.pop_front())?;
        state.counters.dequeued += 1;
        drop(state);

        debug!(request_id = %item.id, priority = item.priority, "Dequeued request");
        Some(item)
    }

    /// Put a dequeued request back at the head of its level
    ///
    /// Used when a consumer could not start the request. The level may
    /// briefly hold one item over its capacity.
    pub fn requeue(&self, item: RequestItem<P>) {
        let mut state = self.state.lock();
        debug!(request_id = %item.id, priority = item.priority, "Requeued request");
        let level = item.priority.min(state.levels.len() - 1);
        state.levels[level].push_front(item);
        state.counters.dequeued = state.counters.dequeued.saturating_sub(1);
        drop(state);

        self.available.notify_one();
    }

    /// Wait up to `wait` for a request to become available
    pub async fn next(&self, wait: Duration) -> Option<RequestItem<P>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.dequeue() {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.dequeue();
            }
        }
    }

    /// Record the outcome of a processed request
    ///
    /// Feeds the latency history and success rate, and counts failures
    /// toward the circuit breaker.
    pub fn record_result(&self, request_id: &RequestId, success: bool, latency: Duration, error: Option<&str>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.history.record(latency, success);

        if success {
            state.breaker.record_success();
        } else {
            state.breaker.record_failure(now);
            warn!(
                request_id = %request_id,
                error = error.unwrap_or("unknown"),
                failure_count = state.breaker.failure_count(),
                "Request failed"
            );
        }
    }

    /// Timeout a request submitted now without an explicit one would get
    pub fn adaptive_timeout(&self) -> Duration {
        self.state.lock().history.adaptive_timeout()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().breaker.state()
    }

    /// Number of queued requests across all levels
    pub fn len(&self) -> usize {
        self.state.lock().levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current queue statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let sizes: Vec<usize> = state.levels.iter().map(VecDeque::len).collect();
        let total: usize = sizes.iter().sum();

        QueueStats {
            total_queued_requests: total,
            priority_queue_sizes: sizes,
            queue_utilization: if self.config.max_queue_size == 0 {
                0.0
            } else {
                total as f64 / self.config.max_queue_size as f64
            },
            circuit_state: state.breaker.state(),
            circuit_breaker_failures: state.breaker.failure_count(),
            circuit_open_count: state.breaker.open_count(),
            success_rate: state.history.success_rate(),
            avg_response_time: state.history.average_latency().as_secs_f64(),
            adaptive_timeout: state.history.adaptive_timeout().as_secs_f64(),
            total_enqueued: state.counters.enqueued,
            total_dequeued: state.counters.dequeued,
            rejected_queue_full: state.counters.rejected_queue_full,
            rejected_circuit_open: state.counters.rejected_circuit_open,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn next_id(&self, priority: usize) -> RequestId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        RequestId(format!(
            "req_{}_{}_{}",
            chrono::Utc::now().timestamp_micros(),
            seq,
            priority
        ))
    }
}
