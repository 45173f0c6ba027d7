use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::{LoggingConfig, SlidegateConfig};
use slidegate::ratelimit::{
    AtomicSlidingWindowLimiter, Lease, LimitRules, PartitionLimiter, RetryAfter,
    SlidingWindowLimiter,
};
use slidegate::store::RedisOrderedStore;

/// Probe sliding window limits against the shared store.
#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about)]
struct Cli {
    /// Configuration file (YAML); SLIDEGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Try to acquire permits for a partition
    Acquire {
        partition: String,
        #[command(flatten)]
        limit: LimitArgs,
    },
    /// Show the current window occupancy of a partition
    Stats {
        partition: String,
        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window_secs: u64,
    },
    /// Fire concurrent acquisitions at one partition
    Burst {
        partition: String,
        /// Number of concurrent callers
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[command(flatten)]
        limit: LimitArgs,
    },
}

#[derive(Debug, clap::Args)]
struct LimitArgs {
    /// Permits consumed per acquisition
    #[arg(long, default_value_t = 1)]
    permits: u32,
    /// Window length in seconds
    #[arg(long, default_value_t = 60)]
    window_secs: u64,
    /// Maximum permits per window
    #[arg(long, default_value_t = 10)]
    limit: u64,
    /// Take window and limit from this rule in the configured rules file
    #[arg(long)]
    rule: Option<String>,
}

impl LimitArgs {
    fn resolve(&self, rules: &LimitRules) -> anyhow::Result<(Duration, u64)> {
        match &self.rule {
            Some(name) => {
                let rule = rules
                    .find(name)
                    .with_context(|| format!("no rule named {} and no default rule", name))?;
                Ok((rule.window(), rule.requests_per_unit))
            }
            None => Ok((Duration::from_secs(self.window_secs), self.limit)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SlidegateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Slidegate probe");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        store_url = %config.store.url,
        key_prefix = %config.store.key_prefix,
        failure_mode = config.limiter.failure_mode.as_str(),
        atomic = config.limiter.atomic,
        "Configuration loaded"
    );

    tokio::select! {
        result = run(cli.command, config) => result?,
        _ = shutdown_signal() => {}
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(command: Command, config: SlidegateConfig) -> anyhow::Result<()> {
    let rules = match &config.limiter.rules_path {
        Some(path) => LimitRules::from_file(path)?,
        None => LimitRules::new(),
    };

    let store = Arc::new(
        RedisOrderedStore::connect(&config.store.url)
            .await
            .with_context(|| format!("failed to connect to {}", config.store.url))?,
    );

    let soft = SlidingWindowLimiter::from_config(store, &config.store, &config.limiter);
    let limiter: Arc<dyn PartitionLimiter> = if config.limiter.atomic {
        Arc::new(AtomicSlidingWindowLimiter::from_limiter(soft))
    } else {
        Arc::new(soft)
    };
    info!("Limiter initialized");

    match command {
        Command::Acquire { partition, limit } => {
            let (window, max) = limit.resolve(&rules)?;
            let lease = limiter
                .try_acquire(&partition, limit.permits, window, max)
                .await?;
            print_json(&lease_json(&partition, &lease))?;
        }
        Command::Stats {
            partition,
            window_secs,
        } => {
            let stats = limiter
                .get_statistics(&partition, Duration::from_secs(window_secs))
                .await?;
            print_json(&json!({ "partition": partition, "statistics": stats }))?;
        }
        Command::Burst {
            partition,
            concurrency,
            limit,
        } => {
            let (window, max) = limit.resolve(&rules)?;
            let attempts = (0..concurrency).map(|_| {
                let limiter = limiter.clone();
                let partition = partition.clone();
                let permits = limit.permits;
                async move { limiter.try_acquire(&partition, permits, window, max).await }
            });

            let mut admitted = 0usize;
            for lease in futures::future::join_all(attempts).await {
                if lease?.is_acquired() {
                    admitted += 1;
                }
            }

            let stats = limiter.get_statistics(&partition, window).await?;
            print_json(&json!({
                "partition": partition,
                "attempted": concurrency,
                "admitted": admitted,
                "limit": max,
                "window_count": stats.current_count,
            }))?;
        }
    }

    Ok(())
}

fn lease_json(partition: &str, lease: &Lease) -> serde_json::Value {
    let retry_after_ms = match lease.retry_after() {
        Some(RetryAfter::After(d)) => json!(d.as_millis() as u64),
        Some(RetryAfter::Never) => json!("never"),
        None => serde_json::Value::Null,
    };
    json!({
        "partition": partition,
        "acquired": lease.is_acquired(),
        "retry_after_ms": retry_after_ms,
        "retry_after_secs": lease.retry_after_secs(),
    })
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, abandoning probe");
        }
        _ = terminate => {
            info!("Received SIGTERM, abandoning probe");
        }
    }
}
