use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Gatekeeper, Work, WorkContext};
use crate::queue::RejectReason;

/// Options for the `simulate` command
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub requests: usize,
    pub workers: usize,
    pub failure_rate: f64,
    pub latency: Duration,
    /// Pause between submissions
    pub interval: Duration,
    /// How long to wait for accepted requests to finish
    pub drain_timeout: Duration,
}

/// Stand-in downstream that sleeps and fails at random
#[derive(Debug)]
pub struct SyntheticWork {
    failure_rate: f64,
    mean_latency: Duration,
}

impl SyntheticWork {
    pub fn new(failure_rate: f64, mean_latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            mean_latency,
        }
    }
}

#[async_trait]
impl Work<u64> for SyntheticWork {
    type Output = Duration;
    type Error = String;

    async fn execute(&self, payload: u64, ctx: &WorkContext) -> Result<Duration, String> {
        let (latency, fail) = {
            let mut rng = rand::thread_rng();
            let jitter: f64 = rng.gen_range(0.5..1.5);
            (self.mean_latency.mul_f64(jitter), rng.gen_bool(self.failure_rate))
        };

        tokio::time::sleep(latency).await;

        if fail {
            Err(format!("synthetic failure for payload {} ({})", payload, ctx.request_id))
        } else {
            Ok(latency)
        }
    }
}

/// Push synthetic work through a gatekeeper and print the final statistics
pub async fn cmd_simulate(config: &Config, opts: SimulateOptions) -> Result<()> {
    let gate = Arc::new(Gatekeeper::from_config(config)?);
    gate.start().await;
    gate.spawn_workers(
        opts.workers.max(1),
        Arc::new(SyntheticWork::new(opts.failure_rate, opts.latency)),
    );

    info!(
        requests = opts.requests,
        workers = opts.workers,
        failure_rate = opts.failure_rate,
        "Starting simulation"
    );

    let started = Instant::now();
    let levels = config.queue.priority_levels.max(1) as i32;
    let mut accepted = 0u64;
    let mut rejected_full = 0u64;
    let mut rejected_open = 0u64;

    for n in 0..opts.requests as u64 {
        let priority = rand::thread_rng().gen_range(0..levels);
        match gate.submit(n, priority, None) {
            Ok(id) => {
                debug!(request_id = %id, priority = priority, "Submitted");
                accepted += 1;
            }
            Err(e) => match e.reason() {
                RejectReason::QueueFull { .. } => rejected_full += 1,
                RejectReason::CircuitOpen { .. } => rejected_open += 1,
            },
        }

        if !opts.interval.is_zero() {
            tokio::time::sleep(opts.interval).await;
        }
    }

    let deadline = Instant::now() + opts.drain_timeout;
    while gate.stats().processed() < accepted {
        if Instant::now() >= deadline {
            warn!(
                pending = accepted - gate.stats().processed(),
                "Drain timeout reached before all requests finished"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let elapsed = started.elapsed();
    gate.stop().await;
    let stats = gate.stats();

    println!("Simulation finished in {:.2}s", elapsed.as_secs_f64());
    println!("  Submitted:              {}", opts.requests);
    println!("  Accepted:               {}", accepted);
    println!("  Rejected (queue full):  {}", rejected_full);
    println!("  Rejected (circuit open): {}", rejected_open);
    println!("  Completed:              {}", stats.completed);
    println!("  Failed:                 {}", stats.failed);
    println!();
    print!(
        "{}",
        serde_yaml::to_string(&stats).context("Failed to serialize statistics")?
    );

    Ok(())
}

/// Print the effective configuration as YAML
pub fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestId;

    fn ctx() -> WorkContext {
        let queue: crate::queue::AdmissionQueue<()> = crate::queue::AdmissionQueue::new(Default::default());
        let request_id: RequestId = queue.enqueue((), 0, None).unwrap();
        WorkContext {
            request_id,
            priority: 0,
            connection: None,
            queued_for: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_work_never_fails_at_zero_rate() {
        let work = SyntheticWork::new(0.0, Duration::from_millis(10));
        for n in 0..20 {
            let latency = work.execute(n, &ctx()).await.unwrap();
            assert!(latency >= Duration::from_millis(5));
            assert!(latency < Duration::from_millis(15));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_work_always_fails_at_full_rate() {
        let work = SyntheticWork::new(3.0, Duration::from_millis(1));
        let err = work.execute(7, &ctx()).await.unwrap_err();
        assert!(err.contains("payload 7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_without_pool() {
        let mut config = Config::new();
        config.pool.enabled = false;
        config.throttle.max_requests_per_second = 1000.0;

        let opts = SimulateOptions {
            requests: 20,
            workers: 4,
            failure_rate: 0.0,
            latency: Duration::from_millis(5),
            interval: Duration::ZERO,
            drain_timeout: Duration::from_secs(10),
        };
        assert!(cmd_simulate(&config, opts).await.is_ok());
    }
}
