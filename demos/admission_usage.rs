//! Example demonstrating the admission pipeline
//!
//! This example shows how to:
//! 1. Configure the queue, throttle and connection pool
//! 2. Submit prioritized requests
//! 3. Process them concurrently with a custom `Work` implementation
//! 4. Watch the circuit breaker open and monitor statistics

use async_trait::async_trait;
use flowgate::pool::{ConnectionPool, PoolConfig};
use flowgate::queue::{AdmissionQueue, QueueConfig};
use flowgate::throttle::{ConcurrencyThrottle, ThrottleConfig};
use flowgate::{Gatekeeper, Work, WorkContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pretend backend that fails every seventh request
struct FlakyBackend;

#[async_trait]
impl Work<u32> for FlakyBackend {
    type Output = String;
    type Error = String;

    async fn execute(&self, payload: u32, ctx: &WorkContext) -> Result<String, String> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        if payload % 7 == 0 {
            return Err(format!("backend rejected request #{}", payload));
        }
        Ok(format!(
            "request #{} served on {}",
            payload,
            ctx.connection.as_deref().unwrap_or("<no pool>")
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let queue = Arc::new(AdmissionQueue::new(QueueConfig {
        max_queue_size: 30,
        priority_levels: 3,
        circuit_breaker_threshold: 3,
        circuit_breaker_timeout: Duration::from_secs(2),
        adaptive_timeout: true,
    }));

    let throttle = Arc::new(ConcurrencyThrottle::new(ThrottleConfig {
        max_concurrent_requests: 4,
        max_requests_per_second: 20.0,
        burst_limit: 5,
    }));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_connections: 4,
        min_connections: 2,
        idle_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    }));

    let gate = Gatekeeper::new(queue, throttle).with_pool(pool);
    gate.start().await;

    // Submit a batch across all priority levels
    for i in 1..=21u32 {
        match gate.submit(i, (i % 3) as i32, None) {
            Ok(id) => info!("Submitted #{} as {}", i, id),
            Err(e) => warn!("Submission #{} rejected: {}", i, e),
        }
    }

    // Four concurrent consumers, bounded by the throttle
    let backend = FlakyBackend;
    let (gate_ref, backend_ref) = (&gate, &backend);
    let consumers = (0..4).map(|_| async move {
        let mut served = 0;
        while let Some(result) = gate_ref.process_next(backend_ref).await {
            match result {
                Ok(done) => {
                    info!("{} in {:?}", done.output, done.latency);
                    served += 1;
                }
                Err(e) => warn!("{}", e),
            }
        }
        served
    });
    let served: usize = futures::future::join_all(consumers).await.into_iter().sum();

    let stats = gate.stats();
    println!("\n=== FINAL STATISTICS ===\n");
    println!("Served: {}", served);
    println!("Circuit state: {}", stats.queue.circuit_state.name());
    println!("Circuit failures: {}", stats.queue.circuit_breaker_failures);
    println!("Success rate: {:.3}", stats.queue.success_rate);
    println!("Adaptive timeout: {:.1}s", stats.queue.adaptive_timeout);
    if let Some(pool) = &stats.pool {
        println!("Pool: {} created, {} reused", pool.total_created, pool.total_reused);
    }

    // Once the breaker has opened, new work is refused until the cool-down passes
    if let Err(e) = gate.submit(100, 0, None) {
        println!("\nAfter failures: {}", e);
        tokio::time::sleep(Duration::from_secs(2)).await;
        println!("After cool-down: {:?}", gate.submit(101, 0, None).map(|id| id.to_string()));
    }

    gate.stop().await;
    Ok(())
}
