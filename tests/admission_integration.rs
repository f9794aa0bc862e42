//! Integration tests for the admission pipeline
//!
//! These tests drive the pool, throttle and queue together through the
//! public API in realistic scenarios.

use async_trait::async_trait;
use flowgate::pool::{ConnectionFactory, ConnectionId, ConnectionPool, PoolConfig, PoolError};
use flowgate::queue::{AdmissionQueue, CircuitState, QueueConfig, RejectReason};
use flowgate::throttle::{ConcurrencyThrottle, ThrottleConfig};
use flowgate::{Gatekeeper, ProcessError, Work, WorkContext};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Factory that counts opens and closes
#[derive(Default)]
struct CountingFactory {
    opened: AtomicU64,
    closed: AtomicU64,
}

#[async_trait]
impl ConnectionFactory for CountingFactory {
    async fn connect(&self) -> Result<ConnectionId, PoolError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(format!("test_conn_{}", n))
    }

    async fn close(&self, _id: &ConnectionId) -> Result<(), PoolError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Echoes the payload, failing when asked to
struct Echo;

#[async_trait]
impl Work<(u32, bool)> for Echo {
    type Output = u32;
    type Error = String;

    async fn execute(&self, payload: (u32, bool), ctx: &WorkContext) -> Result<u32, String> {
        let (value, fail) = payload;
        assert!(ctx.connection.is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        if fail {
            Err(format!("downstream refused {}", value))
        } else {
            Ok(value)
        }
    }
}

fn gatekeeper(factory: Arc<CountingFactory>, threshold: u32) -> Gatekeeper<(u32, bool)> {
    let queue = Arc::new(AdmissionQueue::new(QueueConfig {
        max_queue_size: 60,
        priority_levels: 3,
        circuit_breaker_threshold: threshold,
        circuit_breaker_timeout: Duration::from_secs(5),
        adaptive_timeout: true,
    }));
    let throttle = Arc::new(ConcurrencyThrottle::new(ThrottleConfig {
        max_concurrent_requests: 4,
        max_requests_per_second: 500.0,
        burst_limit: 50,
    }));
    let pool = Arc::new(ConnectionPool::with_factory(
        PoolConfig {
            max_connections: 2,
            min_connections: 1,
            ..PoolConfig::default()
        },
        factory,
    ));
    Gatekeeper::new(queue, throttle).with_pool(pool)
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_holds_over_trailing_second() {
    let rate = 10;
    let throttle = Arc::new(ConcurrencyThrottle::new(ThrottleConfig {
        max_concurrent_requests: 100,
        max_requests_per_second: rate as f64,
        burst_limit: rate,
    }));

    let start = Instant::now();
    let handles: Vec<_> = (0..2 * rate)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move {
                let _permit = throttle.throttle().await.unwrap();
                Instant::now()
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for handle in futures::future::join_all(handles).await {
        admitted.push(handle.unwrap());
    }
    admitted.sort();

    for &t in &admitted {
        let in_window = admitted
            .iter()
            .filter(|&&s| s <= t && t.duration_since(s) < Duration::from_secs(1))
            .count();
        assert!(in_window <= rate, "{} admissions in one second", in_window);
    }

    let last = *admitted.last().unwrap();
    assert!(last.duration_since(start) >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_burst_limit_spreads_admissions() {
    let throttle = ConcurrencyThrottle::new(ThrottleConfig {
        max_concurrent_requests: 10,
        max_requests_per_second: 100.0,
        burst_limit: 3,
    });

    let start = Instant::now();
    for _ in 0..3 {
        drop(throttle.throttle().await.unwrap());
    }
    assert_eq!(throttle.get_current_load().burst_capacity_remaining, 0);

    drop(throttle.throttle().await.unwrap());
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_end_to_end_processing_reuses_connections() {
    let factory = Arc::new(CountingFactory::default());
    let gate = gatekeeper(Arc::clone(&factory), 10);
    gate.start().await;

    for n in 0..6 {
        gate.submit((n, false), 2, None).unwrap();
    }
    gate.submit((99, false), 0, Some(Duration::from_secs(1))).unwrap();

    let first = gate.process_next(&Echo).await.unwrap().unwrap();
    assert_eq!(first.output, 99);

    let mut outputs = Vec::new();
    while let Some(result) = gate.process_next(&Echo).await {
        outputs.push(result.unwrap().output);
    }
    assert_eq!(outputs, vec![0, 1, 2, 3, 4, 5]);

    let stats = gate.stats();
    assert_eq!(stats.completed, 7);
    assert_eq!(stats.queue.total_enqueued, 7);
    assert_eq!(stats.queue.total_dequeued, 7);

    // Sequential processing never needs more than the pre-warmed connection
    let pool = stats.pool.unwrap();
    assert_eq!(pool.total_created, 1);
    assert_eq!(pool.total_reused, 7);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 1);

    gate.stop().await;
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_work_errors_open_and_reset_breaker() {
    tokio::time::pause();
    let factory = Arc::new(CountingFactory::default());
    let gate = gatekeeper(factory, 3);

    for n in 0..3 {
        gate.submit((n, true), 1, None).unwrap();
    }
    for _ in 0..3 {
        let err = gate.process_next(&Echo).await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessError::Work { .. }));
    }

    assert_eq!(gate.queue().circuit_state(), CircuitState::Open);
    let err = gate.submit((10, false), 0, None).unwrap_err();
    match err.reason() {
        RejectReason::CircuitOpen { retry_in } => assert!(*retry_in <= Duration::from_secs(5)),
        other => panic!("unexpected rejection: {}", other),
    }

    tokio::time::advance(Duration::from_secs(5)).await;

    gate.submit((11, false), 0, None).unwrap();
    assert_eq!(gate.queue().circuit_state(), CircuitState::Closed);
    assert_eq!(gate.process_next(&Echo).await.unwrap().unwrap().output, 11);

    let stats = gate.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.queue.circuit_open_count, 1);
    assert_eq!(stats.queue.rejected_circuit_open, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_times_out() {
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 1,
        min_connections: 0,
        connection_timeout: Duration::from_millis(200),
        ..PoolConfig::default()
    });

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)));

    drop(held);
    let again = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().failed_requests, 1);
    assert_eq!(pool.stats().total_reused, 1);
    drop(again);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_work_releases_resources() {
    let factory = Arc::new(CountingFactory::default());
    let gate = Arc::new(gatekeeper(factory, 10));

    struct Forever;

    #[async_trait]
    impl Work<(u32, bool)> for Forever {
        type Output = ();
        type Error = String;

        async fn execute(&self, _payload: (u32, bool), _ctx: &WorkContext) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    gate.submit((1, false), 0, None).unwrap();
    let cancelled = tokio::time::timeout(Duration::from_millis(50), gate.process_next(&Forever)).await;
    assert!(cancelled.is_err());

    let stats = gate.stats();
    assert_eq!(stats.throttle.concurrent_requests, 0);
    let pool = stats.pool.unwrap();
    assert_eq!(pool.active_connections, 0);
    assert_eq!(pool.idle_connections, 1);
}
