//! Gatekeeper: the admission queue, throttle and pool wired together
//!
//! Callers `submit` work into the priority queue. Consumers (either explicit
//! `process_next` calls or the tasks started by `spawn_workers`) take the
//! highest priority request, wait for a throttle slot, check out a pooled
//! connection and run the work under the request's timeout. The outcome is
//! fed back to the queue so the circuit breaker and adaptive timeouts track
//! downstream health.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::pool::{ConnectionId, ConnectionPool, PoolError, PoolStats, PooledConnection};
use crate::queue::{AdmissionQueue, QueueError, QueueStats, RequestId, RequestItem};
use crate::throttle::{ConcurrencyThrottle, LoadSnapshot, ThrottleError, ThrottlePermit};

/// How long an idle worker waits on the queue before checking again
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a unit of work knows about its admission
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub request_id: RequestId,
    pub priority: usize,
    /// Pooled connection checked out for this request, if a pool is configured
    pub connection: Option<ConnectionId>,
    /// Time spent in the queue before a consumer picked the request up
    pub queued_for: Duration,
}

/// The downstream operation guarded by the gatekeeper
#[async_trait]
pub trait Work<P: Send + 'static>: Send + Sync {
    type Output: Send;
    type Error: fmt::Display + fmt::Debug + Send;

    async fn execute(&self, payload: P, ctx: &WorkContext) -> Result<Self::Output, Self::Error>;
}

/// A request that ran to completion
#[derive(Debug)]
pub struct Completed<T> {
    pub id: RequestId,
    pub output: T,
    /// Execution time, excluding queueing and throttling
    pub latency: Duration,
}

/// Why processing an admitted request failed
#[derive(Debug, thiserror::Error)]
pub enum ProcessError<E> {
    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error("Request {id} failed: {error}")]
    Work { id: RequestId, error: E },
}

impl<E> ProcessError<E> {
    /// True when the failure comes from the gatekeeper shutting down
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            ProcessError::Throttle(ThrottleError::Closed) | ProcessError::Pool(PoolError::Closed)
        )
    }
}

/// Combined statistics of every component
#[derive(Debug, Clone, Serialize)]
pub struct GatekeeperStats {
    pub completed: u64,
    pub failed: u64,
    pub queue: QueueStats,
    pub throttle: LoadSnapshot,
    pub pool: Option<PoolStats>,
}

impl GatekeeperStats {
    /// Requests that finished, successfully or not
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Throttle slot and pooled connection held while a request runs
struct Reservation {
    picked_up: Instant,
    permit: ThrottlePermit,
    connection: Option<PooledConnection>,
}

/// Front door for a downstream dependency
pub struct Gatekeeper<P> {
    queue: Arc<AdmissionQueue<P>>,
    throttle: Arc<ConcurrencyThrottle>,
    pool: Option<Arc<ConnectionPool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<P: Send + 'static> Gatekeeper<P> {
    /// Gatekeeper without a connection pool
    pub fn new(queue: Arc<AdmissionQueue<P>>, throttle: Arc<ConcurrencyThrottle>) -> Self {
        Self {
            queue,
            throttle,
            pool: None,
            workers: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Route every request through `pool`
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Build every component from the loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let queue = Arc::new(AdmissionQueue::new(config.queue.to_queue_config()?));
        let throttle = Arc::new(ConcurrencyThrottle::new(config.throttle.to_throttle_config()));
        let gate = Self::new(queue, throttle);

        if config.pool.enabled {
            let pool = Arc::new(ConnectionPool::new(config.pool.to_pool_config()?));
            Ok(gate.with_pool(pool))
        } else {
            Ok(gate)
        }
    }

    /// Admit a request into the priority queue
    pub fn submit(&self, payload: P, priority: i32, timeout: Option<Duration>) -> Result<RequestId, QueueError> {
        self.queue.enqueue(payload, priority, timeout)
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue<P>> {
        &self.queue
    }

    pub fn throttle(&self) -> &Arc<ConcurrencyThrottle> {
        &self.throttle
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Pre-warm the pool and start its idle eviction
    pub async fn start(&self) {
        info!(pool = self.pool.is_some(), "Starting gatekeeper");
        if let Some(pool) = &self.pool {
            pool.start().await;
        }
    }

    /// Abort the workers, close the throttle and shut the pool down
    ///
    /// Requests still queued stay queued. `process_next` leaves them in place
    /// once stopped, so they can be drained with `queue().dequeue()`.
    pub async fn stop(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        info!(workers = workers.len(), "Stopping gatekeeper");
        for worker in workers {
            worker.abort();
        }

        self.throttle.close();
        if let Some(pool) = &self.pool {
            pool.stop().await;
        }
    }

    /// Process the next queued request, if there is one
    ///
    /// After `stop` the request is not consumed: it goes back to the head of
    /// its level and a shutdown error is returned.
    pub async fn process_next<W>(&self, work: &W) -> Option<Result<Completed<W::Output>, ProcessError<W::Error>>>
    where
        W: Work<P>,
    {
        if self.throttle.is_closed() {
            return if self.queue.is_empty() {
                None
            } else {
                Some(Err(ThrottleError::Closed.into()))
            };
        }

        let item = self.queue.dequeue()?;
        Some(self.process_or_requeue(item, work).await)
    }

    /// Run one admitted request through throttle, pool and work
    ///
    /// The throttle slot and the pooled connection are released on every
    /// exit path, including cancellation of the returned future.
    pub async fn process<W>(
        &self,
        item: RequestItem<P>,
        work: &W,
    ) -> Result<Completed<W::Output>, ProcessError<W::Error>>
    where
        W: Work<P>,
    {
        let reservation = self.reserve(&item.id).await?;
        self.run(item, reservation, work).await
    }

    /// Like `process`, but hands the request back to the queue on shutdown
    async fn process_or_requeue<W>(
        &self,
        item: RequestItem<P>,
        work: &W,
    ) -> Result<Completed<W::Output>, ProcessError<W::Error>>
    where
        W: Work<P>,
    {
        match self.reserve(&item.id).await {
            Ok(reservation) => self.run(item, reservation, work).await,
            Err(e) => {
                if e.is_shutdown() {
                    self.queue.requeue(item);
                }
                Err(e)
            }
        }
    }

    /// Take a throttle slot, then a pooled connection when a pool is set
    async fn reserve<E>(&self, id: &RequestId) -> Result<Reservation, ProcessError<E>> {
        let picked_up = Instant::now();
        let permit = self.throttle.throttle().await?;

        let connection = match &self.pool {
            Some(pool) => match pool.acquire().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    if !matches!(e, PoolError::Closed) {
                        self.fail(id, Duration::ZERO, &e.to_string());
                    }
                    return Err(e.into());
                }
            },
            None => None,
        };

        Ok(Reservation {
            picked_up,
            permit,
            connection,
        })
    }

    async fn run<W>(
        &self,
        item: RequestItem<P>,
        reservation: Reservation,
        work: &W,
    ) -> Result<Completed<W::Output>, ProcessError<W::Error>>
    where
        W: Work<P>,
    {
        let RequestItem {
            id,
            payload,
            priority,
            timeout,
            enqueued_at,
            ..
        } = item;
        let Reservation {
            picked_up,
            permit,
            connection,
        } = reservation;
        let queued_for = picked_up.saturating_duration_since(enqueued_at);

        let ctx = WorkContext {
            request_id: id.clone(),
            priority,
            connection: connection.as_ref().map(|conn| conn.id().clone()),
            queued_for,
        };

        debug!(
            request_id = %id,
            priority = priority,
            queued_ms = queued_for.as_millis() as u64,
            throttled_ms = permit.waited().as_millis() as u64,
            "Executing request"
        );

        let started = Instant::now();
        let outcome = match timeout {
            Some(after) => tokio::time::timeout(after, work.execute(payload, &ctx))
                .await
                .map_err(|_| after),
            None => Ok(work.execute(payload, &ctx).await),
        };
        let latency = started.elapsed();

        drop(connection);
        drop(permit);

        match outcome {
            Ok(Ok(output)) => {
                self.queue.record_result(&id, true, latency, None);
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(Completed { id, output, latency })
            }
            Ok(Err(error)) => {
                self.fail(&id, latency, &error.to_string());
                Err(ProcessError::Work { id, error })
            }
            Err(after) => {
                self.fail(&id, latency, "timeout");
                Err(ProcessError::Timeout { id, after })
            }
        }
    }

    fn fail(&self, id: &RequestId, latency: Duration, reason: &str) {
        self.queue.record_result(id, false, latency, Some(reason));
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Start `count` consumer tasks that process requests as they arrive
    ///
    /// Workers run until `stop` is called.
    pub fn spawn_workers<W>(self: &Arc<Self>, count: usize, work: Arc<W>)
    where
        W: Work<P> + 'static,
    {
        let mut workers = self.workers.lock();
        for worker in 0..count {
            let gate = Arc::clone(self);
            let work = Arc::clone(&work);

            workers.push(tokio::spawn(async move {
                debug!(worker = worker, "Worker started");
                loop {
                    let Some(item) = gate.queue.next(WORKER_POLL_INTERVAL).await else {
                        continue;
                    };

                    match gate.process_or_requeue(item, work.as_ref()).await {
                        Ok(done) => debug!(
                            worker = worker,
                            request_id = %done.id,
                            latency_ms = done.latency.as_millis() as u64,
                            "Request completed"
                        ),
                        Err(e) if e.is_shutdown() => {
                            debug!(worker = worker, "Gatekeeper closed, worker exiting");
                            break;
                        }
                        Err(e) => warn!(worker = worker, error = %e, "Request processing failed"),
                    }
                }
            }));
        }
        info!(workers = workers.len(), "Workers running");
    }

    /// Snapshot of the queue, throttle and pool statistics
    pub fn stats(&self) -> GatekeeperStats {
        GatekeeperStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            throttle: self.throttle.get_current_load(),
            pool: self.pool.as_ref().map(|pool| pool.stats()),
        }
    }
}
