//! Bounded connection pool with scoped acquisition
//!
//! This module provides a pool of reusable connection handles with:
//! - A global cap on handles in use, enforced by a semaphore
//! - Pre-warming of `min_connections` idle handles on start
//! - RAII guards that always hand the connection back, even on cancellation
//! - Background eviction of handles that sat idle for too long

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::factory::{ConnectionFactory, LocalConnectionFactory};

/// Opaque identifier of a pooled connection
pub type ConnectionId = String;

/// Smoothing factor for the response time moving average
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to create connection: {0}")]
    ConnectionFailed(String),

    #[error("Failed to close connection {id}: {reason}")]
    CloseFailed { id: ConnectionId, reason: String },

    #[error("Timed out after {0:?} waiting for a free connection slot")]
    Timeout(Duration),

    #[error("Connection pool is closed")]
    Closed,
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + active)
    pub max_connections: usize,

    /// Number of connections created up front by `start()`
    pub min_connections: usize,

    /// How long `acquire()` may wait for a free slot
    pub connection_timeout: Duration,

    /// Maximum idle time before a connection is closed
    pub idle_timeout: Duration,

    /// Extra attempts after a failed connection creation
    pub max_retries: u32,

    /// Pause between creation attempts
    pub retry_delay: Duration,

    /// How often the background task scans for expired idle connections
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active_connections: usize,

    /// Connections waiting in the idle set
    pub idle_connections: usize,

    /// Total acquisition attempts
    pub total_requests: u64,

    /// Acquisition attempts that failed
    pub failed_requests: u64,

    /// Total connections created
    pub total_created: u64,

    /// Total idle connections handed out again
    pub total_reused: u64,

    /// Idle connections closed for exceeding the idle timeout
    pub total_evicted: u64,

    /// Moving average of acquisition-to-release time, in seconds
    pub avg_response_time: f64,

    /// Active connections divided by the configured maximum
    pub utilization: f64,

    pub last_updated: DateTime<Utc>,
}

impl Default for PoolStats {
    fn default() -> Self {
        Self {
            active_connections: 0,
            idle_connections: 0,
            total_requests: 0,
            failed_requests: 0,
            total_created: 0,
            total_reused: 0,
            total_evicted: 0,
            avg_response_time: 0.0,
            utilization: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl PoolStats {
    fn record_response_time(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        if self.avg_response_time == 0.0 {
            self.avg_response_time = sample;
        } else {
            self.avg_response_time =
                RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time;
        }
    }
}

/// A connection parked in the idle set
struct IdleConnection {
    id: ConnectionId,
    created_at: Instant,
    idle_since: Instant,
}

impl IdleConnection {
    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.idle_since) > idle_timeout
    }
}

/// Everything guarded by the pool lock
struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: HashMap<ConnectionId, Instant>,
    stats: PoolStats,
    closed: bool,
}

impl PoolState {
    fn refresh(&mut self, max_connections: usize) {
        self.stats.active_connections = self.active.len();
        self.stats.idle_connections = self.idle.len();
        self.stats.utilization = if max_connections == 0 {
            0.0
        } else {
            self.active.len() as f64 / max_connections as f64
        };
        self.stats.last_updated = Utc::now();
    }
}

/// State shared between the pool, its guards and the eviction task
struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    async fn checkout(self: &Arc<Self>, acquired_at: Instant) -> Result<PooledConnection, PoolError> {
        let permit = tokio::time::timeout(
            self.config.connection_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Timeout(self.config.connection_timeout))?
        .map_err(|_| PoolError::Closed)?;

        let (reusable, expired) = self.take_idle();
        for id in &expired {
            debug!(connection = %id, "Discarding expired idle connection");
            self.close_connection(id).await;
        }

        let (id, created_at) = match reusable {
            Some(conn) => (conn.id, conn.created_at),
            None => (self.create_connection().await?, Instant::now()),
        };

        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.active.insert(id.clone(), created_at);
                state.refresh(self.config.max_connections);
            }
            state.closed
        };

        if closed {
            self.close_connection(&id).await;
            return Err(PoolError::Closed);
        }

        Ok(PooledConnection {
            id,
            created_at,
            acquired_at,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Pop the first non-expired idle connection, collecting expired ones on the way
    fn take_idle(&self) -> (Option<IdleConnection>, Vec<ConnectionId>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut reusable = None;

        let mut state = self.state.lock();
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_expired(self.config.idle_timeout, now) {
                expired.push(conn.id);
            } else {
                state.stats.total_reused += 1;
                reusable = Some(conn);
                break;
            }
        }
        state.stats.total_evicted += expired.len() as u64;
        state.refresh(self.config.max_connections);

        (reusable, expired)
    }

    async fn create_connection(&self) -> Result<ConnectionId, PoolError> {
        let mut attempt = 0;
        loop {
            match self.factory.connect().await {
                Ok(id) => {
                    let mut state = self.state.lock();
                    state.stats.total_created += 1;
                    debug!(
                        connection = %id,
                        total_created = state.stats.total_created,
                        "Created new connection"
                    );
                    return Ok(id);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Hand a connection back; runs from `PooledConnection::drop`
    fn release(&self, id: ConnectionId, created_at: Instant, acquired_at: Instant) {
        let now = Instant::now();
        let overflow = {
            let mut state = self.state.lock();
            state.active.remove(&id);
            state.stats.record_response_time(now.saturating_duration_since(acquired_at));

            let overflow = if state.closed || state.idle.len() >= self.config.max_connections {
                Some(id)
            } else {
                state.idle.push_back(IdleConnection {
                    id,
                    created_at,
                    idle_since: now,
                });
                None
            };
            state.refresh(self.config.max_connections);
            overflow
        };

        if let Some(id) = overflow {
            debug!(connection = %id, "Idle set full or pool closed, closing connection");
            self.close_detached(id);
        }
    }

    /// Put a freshly created handle in the idle set if it fits under the cap
    ///
    /// Every slot holder may own a handle, so the idle set only grows while
    /// it is smaller than the number of free slots. Returns the handle when
    /// it does not fit.
    fn park_prewarmed(&self, id: ConnectionId) -> Option<ConnectionId> {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.slots.available_permits() {
            return Some(id);
        }

        let now = Instant::now();
        state.idle.push_back(IdleConnection {
            id,
            created_at: now,
            idle_since: now,
        });
        state.refresh(self.config.max_connections);
        None
    }

    /// Close idle connections that exceeded the idle timeout
    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = {
            let mut state = self.state.lock();
            let idle = std::mem::take(&mut state.idle);
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle
                .into_iter()
                .partition(|conn| !conn.is_expired(self.config.idle_timeout, now));
            state.idle = keep;
            state.stats.total_evicted += expired.len() as u64;
            state.refresh(self.config.max_connections);
            expired.into_iter().map(|conn| conn.id).collect()
        };

        for id in &expired {
            self.close_connection(id).await;
            debug!(connection = %id, "Cleaned up idle connection");
        }

        expired.len()
    }

    async fn close_connection(&self, id: &ConnectionId) {
        if let Err(e) = self.factory.close(id).await {
            warn!(connection = %id, error = %e, "Failed to close connection");
        }
    }

    /// Close from a synchronous context by handing the work to the runtime
    fn close_detached(&self, id: ConnectionId) {
        let factory = Arc::clone(&self.factory);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = factory.close(&id).await {
                        warn!(connection = %id, error = %e, "Failed to close connection");
                    }
                });
            }
            Err(_) => {
                warn!(connection = %id, "No runtime available, dropping connection unclosed");
            }
        }
    }
}

/// A connection checked out of the pool
///
/// Dropping the guard returns the connection to the idle set and frees the
/// slot, whether the holder finished normally, returned an error or was
/// cancelled.
pub struct PooledConnection {
    id: ConnectionId,
    created_at: Instant,
    acquired_at: Instant,
    pool: Arc<PoolShared>,
    // Dropped after `Drop::drop` has put the connection back
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Identifier of the underlying connection
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since this guard was requested
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.age())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        self.pool.release(id, self.created_at, self.acquired_at);
    }
}

/// Bounded pool of reusable connections
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool backed by [`LocalConnectionFactory`]
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, Arc::new(LocalConnectionFactory::new()))
    }

    /// Create a pool that opens connections through `factory`
    pub fn with_factory(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_connections));
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_connections),
            active: HashMap::new(),
            stats: PoolStats::default(),
            closed: false,
        };

        Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                slots,
                state: Mutex::new(state),
            }),
            eviction_task: Mutex::new(None),
        }
    }

    /// Top the pool up to `min_connections` handles and start idle eviction
    ///
    /// Handles already idle or checked out count toward the minimum, so
    /// calling `start` again or after acquisitions never exceeds
    /// `max_connections`.
    pub async fn start(&self) {
        let config = &self.shared.config;
        let missing = {
            let state = self.shared.state.lock();
            if state.closed {
                warn!("Connection pool already stopped, ignoring start");
                return;
            }
            config
                .min_connections
                .min(config.max_connections)
                .saturating_sub(state.idle.len() + state.active.len())
        };

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            prewarm = missing,
            "Starting connection pool"
        );

        for _ in 0..missing {
            match self.shared.create_connection().await {
                Ok(id) => {
                    if let Some(surplus) = self.shared.park_prewarmed(id) {
                        debug!(connection = %surplus, "Pool filled while pre-warming, closing connection");
                        self.shared.close_connection(&surplus).await;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to pre-warm connection"),
            }
        }

        let task = self.spawn_eviction_task();
        if let Some(previous) = self.eviction_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop eviction, refuse new acquisitions and close every idle connection
    ///
    /// Connections still checked out are closed when their guards drop.
    pub async fn stop(&self) {
        info!("Stopping connection pool");

        if let Some(task) = self.eviction_task.lock().take() {
            task.abort();
        }
        self.shared.slots.close();

        let drained: Vec<ConnectionId> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            let drained = state.idle.drain(..).map(|conn| conn.id).collect();
            state.refresh(self.shared.config.max_connections);
            drained
        };

        for id in &drained {
            self.shared.close_connection(id).await;
        }
    }

    /// Check out a connection, waiting up to `connection_timeout` for a slot
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let acquired_at = Instant::now();
        self.shared.state.lock().stats.total_requests += 1;

        match self.shared.checkout(acquired_at).await {
            Ok(conn) => {
                debug!(connection = %conn.id, "Acquired connection");
                Ok(conn)
            }
            Err(e) => {
                self.shared.state.lock().stats.failed_requests += 1;
                error!(error = %e, "Connection pool error");
                Err(e)
            }
        }
    }

    /// Manually run one idle eviction pass, returning how many were closed
    pub async fn evict_expired(&self) -> usize {
        self.shared.evict_expired().await
    }

    /// Snapshot of the pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut state = self.shared.state.lock();
        state.refresh(self.shared.config.max_connections);
        state.stats.clone()
    }

    /// Slots not currently held by a guard
    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn spawn_eviction_task(&self) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let period = self.shared.config.eviction_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let evicted = shared.evict_expired().await;
                if evicted > 0 {
                    debug!(evicted = evicted, "Idle eviction cycle finished");
                }
            }
        })
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(task) = self.eviction_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Factory that fails a fixed number of times before succeeding
    struct FlakyFactory {
        failures_left: AtomicU32,
        created: AtomicU64,
    }

    impl FlakyFactory {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                created: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for FlakyFactory {
        async fn connect(&self) -> Result<ConnectionId, PoolError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PoolError::ConnectionFailed("backend refused".to_string()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("flaky-{}", n))
        }

        async fn close(&self, _id: &ConnectionId) -> Result<(), PoolError> {
            Ok(())
        }
    }

    fn small_config(max: usize, min: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            min_connections: min,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
            eviction_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_prewarms_min_connections() {
        let pool = ConnectionPool::new(small_config(5, 3));
        pool.start().await;

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 3);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_created, 3);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_connection_is_reused() {
        let pool = ConnectionPool::new(small_config(2, 0));

        let first_id = {
            let conn = pool.acquire().await.unwrap();
            let stats = pool.stats();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.idle_connections, 0);
            conn.id().clone()
        };

        // Never in both sets
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), &first_id);
        assert_eq!(pool.stats().total_reused, 1);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_waits_for_release() {
        let pool = ConnectionPool::new(small_config(2, 0));

        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(100), pool.acquire())
            .await
            .expect("slot should be free after release");
        assert!(third.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let mut config = small_config(1, 0);
        config.connection_timeout = Duration::from_millis(200);
        let pool = ConnectionPool::new(config);

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;

        assert!(matches!(result, Err(PoolError::Timeout(_))));
        let stats = pool.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_retries_then_succeeds() {
        let mut config = small_config(2, 0);
        config.max_retries = 2;
        let pool = ConnectionPool::with_factory(config, Arc::new(FlakyFactory::new(2)));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), "flaky-0");
        assert_eq!(pool.stats().failed_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_propagates() {
        let mut config = small_config(2, 0);
        config.max_retries = 1;
        let pool = ConnectionPool::with_factory(config, Arc::new(FlakyFactory::new(5)));

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::ConnectionFailed(_))));

        let stats = pool.stats();
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(pool.available_slots(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prewarm_failures_are_not_fatal() {
        let pool = ConnectionPool::with_factory(small_config(4, 3), Arc::new(FlakyFactory::new(2)));
        pool.start().await;

        assert_eq!(pool.stats().idle_connections, 1);
        assert!(pool.acquire().await.is_ok());

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_eviction_closes_stale_connections() {
        let mut config = small_config(4, 2);
        config.idle_timeout = Duration::from_secs(10);
        config.eviction_interval = Duration::from_secs(60);
        let pool = ConnectionPool::new(config);
        pool.start().await;
        assert_eq!(pool.stats().idle_connections, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_evicted, 2);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_connection_is_replaced_on_acquire() {
        let mut config = small_config(2, 1);
        config.idle_timeout = Duration::from_secs(1);
        let pool = ConnectionPool::new(config);
        pool.start().await;

        tokio::time::sleep(Duration::from_secs(2)).await;

        let _conn = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(stats.total_reused, 0);
        assert_eq!(stats.total_created, 2);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_released_when_task_is_cancelled() {
        let pool = Arc::new(ConnectionPool::new(small_config(1, 0)));

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _conn = pool.acquire().await.unwrap();
                std::future::pending::<()>().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().active_connections, 1);

        holder.abort();
        let _ = holder.await;

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_plus_idle_never_exceeds_max() {
        let pool = Arc::new(ConnectionPool::new(small_config(3, 2)));
        pool.start().await;

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let _conn = pool.acquire().await.unwrap();
                let stats = pool.stats();
                assert!(stats.active_connections + stats.idle_connections <= 3);
                tokio::time::sleep(Duration::from_millis(5 * (i % 4))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert!(stats.idle_connections <= 3);
        assert_eq!(stats.total_requests, 12);
        assert!(stats.avg_response_time >= 0.0);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_idle_and_rejects_acquire() {
        let pool = ConnectionPool::new(small_config(3, 2));
        pool.start().await;

        pool.stop().await;
        assert_eq!(pool.stats().idle_connections, 0);

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_counts_checked_out_connections() {
        let pool = ConnectionPool::new(small_config(2, 2));

        let _first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        pool.start().await;

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_created, 2);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_does_not_overfill() {
        let pool = ConnectionPool::new(small_config(2, 2));
        pool.start().await;
        pool.start().await;

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_created, 2);

        let _conn = pool.acquire().await.unwrap();
        pool.start().await;
        let stats = pool.stats();
        assert_eq!(stats.active_connections + stats.idle_connections, 2);

        pool.stop().await;
    }

    /// Factory whose `close` always fails
    #[derive(Default)]
    struct StickyFactory {
        close_attempts: AtomicU64,
        created: AtomicU64,
    }

    #[async_trait]
    impl ConnectionFactory for StickyFactory {
        async fn connect(&self) -> Result<ConnectionId, PoolError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sticky-{}", n))
        }

        async fn close(&self, id: &ConnectionId) -> Result<(), PoolError> {
            self.close_attempts.fetch_add(1, Ordering::SeqCst);
            Err(PoolError::CloseFailed {
                id: id.clone(),
                reason: "socket already gone".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_close_during_eviction_is_absorbed() {
        let factory = Arc::new(StickyFactory::default());
        let mut config = small_config(3, 2);
        config.idle_timeout = Duration::from_secs(1);
        let pool = ConnectionPool::with_factory(config, factory.clone());
        pool.start().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.evict_expired().await, 2);

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_evicted, 2);
        assert_eq!(factory.close_attempts.load(Ordering::SeqCst), 2);

        // Still serving after the failed closes
        assert!(pool.acquire().await.is_ok());
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_close_during_stop_still_drains() {
        let factory = Arc::new(StickyFactory::default());
        let pool = ConnectionPool::with_factory(small_config(3, 3), factory.clone());
        pool.start().await;

        pool.stop().await;

        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(factory.close_attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_close_on_release_after_stop() {
        let factory = Arc::new(StickyFactory::default());
        let pool = ConnectionPool::with_factory(small_config(2, 0), factory.clone());

        let conn = pool.acquire().await.unwrap();
        pool.stop().await;
        drop(conn);

        // The close runs on a spawned task
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(factory.close_attempts.load(Ordering::SeqCst), 1);
    }
}
