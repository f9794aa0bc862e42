//! flowgate - admission control for async workloads
//!
//! Bounded connection pooling, concurrency and rate throttling, and a
//! priority admission queue with circuit breaking and adaptive timeouts.

pub mod cli;
pub mod config;
pub mod core;
pub mod pool;
pub mod queue;
pub mod throttle;

pub use config::Config;
pub use core::{Completed, Gatekeeper, GatekeeperStats, ProcessError, Work, WorkContext};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PooledConnection};
pub use queue::{AdmissionQueue, QueueConfig, QueueError, RejectReason, RequestId};
pub use throttle::{ConcurrencyThrottle, ThrottleConfig, ThrottleError, ThrottlePermit};
