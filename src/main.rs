use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowgate::cli::{self, SimulateOptions};
use flowgate::config;

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(version, about = "Admission control for async workloads: priority queue, throttle and connection pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); FLOWGATE_* environment variables are used otherwise
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Push synthetic requests through the admission pipeline
    Simulate {
        /// Number of requests to submit
        #[arg(long, default_value = "200")]
        requests: usize,

        /// Number of consumer workers
        #[arg(long, default_value = "8")]
        workers: usize,

        /// Probability that a request fails (0.0 - 1.0)
        #[arg(long, default_value = "0.05")]
        failure_rate: f64,

        /// Mean synthetic latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,

        /// Pause between submissions in milliseconds
        #[arg(long, default_value = "0")]
        interval_ms: u64,

        /// Seconds to wait for accepted requests to finish
        #[arg(long, default_value = "60")]
        drain_timeout: u64,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            requests,
            workers,
            failure_rate,
            latency_ms,
            interval_ms,
            drain_timeout,
        } => {
            let opts = SimulateOptions {
                requests,
                workers,
                failure_rate,
                latency: Duration::from_millis(latency_ms),
                interval: Duration::from_millis(interval_ms),
                drain_timeout: Duration::from_secs(drain_timeout),
            };
            cli::cmd_simulate(&config, opts).await?;
        }
        Commands::Config => {
            cli::cmd_config(&config)?;
        }
    }

    Ok(())
}
