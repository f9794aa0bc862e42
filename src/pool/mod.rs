//! Connection pooling module
//!
//! This module provides:
//! - A bounded pool of reusable connection handles
//! - Scoped acquisition through RAII guards
//! - Background eviction of stale idle connections
//! - Pluggable connection factories

pub mod connection;
pub mod factory;

pub use connection::{ConnectionId, ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use factory::{ConnectionFactory, LocalConnectionFactory};
