//! Admission queue module
//!
//! This module provides:
//! - A bounded multi-level priority queue (strict priority, FIFO per level)
//! - A circuit breaker that rejects admissions while downstream is failing
//! - Adaptive per-request timeouts derived from recent latencies

pub mod admission;
pub mod circuit;
pub mod history;

pub use admission::{AdmissionQueue, QueueConfig, QueueError, QueueStats, RejectReason, RequestId, RequestItem};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use history::PerformanceHistory;
