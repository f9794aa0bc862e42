//! Connection factories used by the pool to open and close handles
//!
//! The pool never interprets a handle: it only needs something that can mint
//! an identifier and later release whatever resource sits behind it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::connection::{ConnectionId, PoolError};

/// Opens and closes the resources managed by a [`ConnectionPool`](super::ConnectionPool)
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection and return its identifier
    async fn connect(&self) -> Result<ConnectionId, PoolError>;

    /// Release the resources behind a connection
    async fn close(&self, id: &ConnectionId) -> Result<(), PoolError>;
}

/// Factory that mints opaque in-process identifiers
///
/// Identifiers look like `conn_<unix micros>_<sequence>`, so two handles
/// created in the same microsecond still differ.
#[derive(Debug, Default)]
pub struct LocalConnectionFactory {
    sequence: AtomicU64,
}

impl LocalConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionFactory for LocalConnectionFactory {
    async fn connect(&self) -> Result<ConnectionId, PoolError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("conn_{}_{}", chrono::Utc::now().timestamp_micros(), seq);
        debug!(connection = %id, "Minted local connection id");
        Ok(id)
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), PoolError> {
        debug!(connection = %id, "Closing connection");
        Ok(())
    }
}
