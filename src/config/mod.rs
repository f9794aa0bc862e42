use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use crate::throttle::ThrottleConfig;

/// Connection pool settings (durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Route admitted work through the connection pool
    #[serde(default = "default_pool_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: f64,
}

fn default_pool_enabled() -> bool {
    true
}

fn default_max_connections() -> usize {
    100
}

fn default_min_connections() -> usize {
    10
}

fn default_connection_timeout() -> f64 {
    30.0
}

fn default_idle_timeout() -> f64 {
    300.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    0.1
}

fn default_eviction_interval() -> f64 {
    60.0
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: default_pool_enabled(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: default_idle_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            eviction_interval: default_eviction_interval(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> Result<PoolConfig> {
        Ok(PoolConfig {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            connection_timeout: seconds("pool.connection_timeout", self.connection_timeout)?,
            idle_timeout: seconds("pool.idle_timeout", self.idle_timeout)?,
            max_retries: self.max_retries,
            retry_delay: seconds("pool.retry_delay", self.retry_delay)?,
            eviction_interval: seconds("pool.eviction_interval", self.eviction_interval)?,
        })
    }
}

/// Concurrency throttle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSettings {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,

    #[serde(default = "default_burst_limit")]
    pub burst_limit: usize,
}

fn default_max_concurrent_requests() -> usize {
    50
}

fn default_max_requests_per_second() -> f64 {
    100.0
}

fn default_burst_limit() -> usize {
    20
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_requests_per_second: default_max_requests_per_second(),
            burst_limit: default_burst_limit(),
        }
    }
}

impl ThrottleSettings {
    pub fn to_throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            max_requests_per_second: self.max_requests_per_second,
            burst_limit: self.burst_limit,
        }
    }
}

/// Admission queue settings (durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_priority_levels")]
    pub priority_levels: usize,

    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout: f64,

    #[serde(default = "default_adaptive_timeout")]
    pub adaptive_timeout: bool,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_priority_levels() -> usize {
    3
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> f64 {
    60.0
}

fn default_adaptive_timeout() -> bool {
    true
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            priority_levels: default_priority_levels(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout: default_circuit_breaker_timeout(),
            adaptive_timeout: default_adaptive_timeout(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> Result<QueueConfig> {
        Ok(QueueConfig {
            max_queue_size: self.max_queue_size,
            priority_levels: self.priority_levels,
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: seconds("queue.circuit_breaker_timeout", self.circuit_breaker_timeout)?,
            adaptive_timeout: self.adaptive_timeout,
        })
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub throttle: ThrottleSettings,

    #[serde(default)]
    pub queue: QueueSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.pool.max_connections > 0, "pool.max_connections must be greater than zero");
        ensure!(
            self.pool.min_connections <= self.pool.max_connections,
            "pool.min_connections ({}) exceeds pool.max_connections ({})",
            self.pool.min_connections,
            self.pool.max_connections
        );
        ensure!(
            self.pool.eviction_interval > 0.0,
            "pool.eviction_interval must be greater than zero"
        );

        ensure!(
            self.throttle.max_concurrent_requests > 0,
            "throttle.max_concurrent_requests must be greater than zero"
        );
        ensure!(
            self.throttle.max_requests_per_second.is_finite() && self.throttle.max_requests_per_second > 0.0,
            "throttle.max_requests_per_second must be a positive number"
        );
        ensure!(self.throttle.burst_limit > 0, "throttle.burst_limit must be greater than zero");

        ensure!(self.queue.priority_levels > 0, "queue.priority_levels must be greater than zero");
        ensure!(
            self.queue.max_queue_size >= self.queue.priority_levels,
            "queue.max_queue_size ({}) must be at least queue.priority_levels ({})",
            self.queue.max_queue_size,
            self.queue.priority_levels
        );
        ensure!(
            self.queue.circuit_breaker_threshold > 0,
            "queue.circuit_breaker_threshold must be greater than zero"
        );

        // Surfaces negative or non-finite durations
        self.pool.to_pool_config()?;
        self.queue.to_queue_config()?;

        Ok(())
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid duration for {}: {}", name, value))
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Every setting can be overridden with a `FLOWGATE_` variable:
/// - FLOWGATE_POOL_ENABLED, FLOWGATE_MAX_CONNECTIONS, FLOWGATE_MIN_CONNECTIONS
/// - FLOWGATE_CONNECTION_TIMEOUT, FLOWGATE_IDLE_TIMEOUT (seconds)
/// - FLOWGATE_MAX_RETRIES, FLOWGATE_RETRY_DELAY, FLOWGATE_EVICTION_INTERVAL
/// - FLOWGATE_MAX_CONCURRENT_REQUESTS, FLOWGATE_MAX_REQUESTS_PER_SECOND, FLOWGATE_BURST_LIMIT
/// - FLOWGATE_MAX_QUEUE_SIZE, FLOWGATE_PRIORITY_LEVELS
/// - FLOWGATE_CIRCUIT_BREAKER_THRESHOLD, FLOWGATE_CIRCUIT_BREAKER_TIMEOUT
/// - FLOWGATE_ADAPTIVE_TIMEOUT
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    apply_env("FLOWGATE_POOL_ENABLED", &mut config.pool.enabled)?;
    apply_env("FLOWGATE_MAX_CONNECTIONS", &mut config.pool.max_connections)?;
    apply_env("FLOWGATE_MIN_CONNECTIONS", &mut config.pool.min_connections)?;
    apply_env("FLOWGATE_CONNECTION_TIMEOUT", &mut config.pool.connection_timeout)?;
    apply_env("FLOWGATE_IDLE_TIMEOUT", &mut config.pool.idle_timeout)?;
    apply_env("FLOWGATE_MAX_RETRIES", &mut config.pool.max_retries)?;
    apply_env("FLOWGATE_RETRY_DELAY", &mut config.pool.retry_delay)?;
    apply_env("FLOWGATE_EVICTION_INTERVAL", &mut config.pool.eviction_interval)?;

    apply_env("FLOWGATE_MAX_CONCURRENT_REQUESTS", &mut config.throttle.max_concurrent_requests)?;
    apply_env("FLOWGATE_MAX_REQUESTS_PER_SECOND", &mut config.throttle.max_requests_per_second)?;
    apply_env("FLOWGATE_BURST_LIMIT", &mut config.throttle.burst_limit)?;

    apply_env("FLOWGATE_MAX_QUEUE_SIZE", &mut config.queue.max_queue_size)?;
    apply_env("FLOWGATE_PRIORITY_LEVELS", &mut config.queue.priority_levels)?;
    apply_env("FLOWGATE_CIRCUIT_BREAKER_THRESHOLD", &mut config.queue.circuit_breaker_threshold)?;
    apply_env("FLOWGATE_CIRCUIT_BREAKER_TIMEOUT", &mut config.queue.circuit_breaker_timeout)?;
    apply_env("FLOWGATE_ADAPTIVE_TIMEOUT", &mut config.queue.adaptive_timeout)?;

    Ok(config)
}

fn apply_env<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
    }
    Ok(())
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise starts from the
/// defaults with `FLOWGATE_*` overrides. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
