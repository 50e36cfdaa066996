use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::codec::VersionedCodec;
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{Admission, BucketKey, RateLimiter, SystemClock, Verdict};
use gatekeeper::store::RedisBucketStore;

/// Administrative entry point for the Gatekeeper rate limiter.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one admission check and print the verdict
    Check {
        /// Caller address, as the proxy would forward it
        #[arg(long)]
        caller: Option<String>,
    },
    /// Print the stored state of a bucket
    Inspect {
        /// Raw key: `global` or a caller address
        key: String,
    },
    /// Drop the stored state of a bucket
    Clear {
        /// Raw key: `global` or a caller address
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatekeeperConfig::load(cli.config.as_deref())?;
    info!(
        redis_url = %config.store.redis_url,
        failure_policy = ?config.limits.failure_policy,
        "Configuration loaded"
    );

    let store = RedisBucketStore::connect(
        &config.store,
        Arc::new(VersionedCodec::standard()),
        Arc::new(SystemClock),
    )
    .await?;
    let limiter = Arc::new(RateLimiter::new(Arc::new(store)));

    tokio::select! {
        result = run(cli.command, limiter, config) => result,
        _ = shutdown_signal() => {
            info!("Interrupted before the command finished");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(
    command: Command,
    limiter: Arc<RateLimiter>,
    config: GatekeeperConfig,
) -> anyhow::Result<()> {
    match command {
        Command::Check { caller } => {
            let admission = Admission::new(limiter, config.limits);
            let verdict = admission.admit(caller.as_deref()).await?;
            let output = match verdict {
                Verdict::Allowed => serde_json::json!({ "verdict": "allowed" }),
                Verdict::MissingAddress => serde_json::json!({ "verdict": "missing_address" }),
                Verdict::Throttled { scope, .. } => serde_json::json!({
                    "verdict": "throttled",
                    "scope": scope.to_string(),
                    "retry_after_secs": verdict.retry_after_secs(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Inspect { key } => {
            let key = BucketKey::parse(&key);
            match limiter.inspect(&key).await? {
                Some(snapshot) => {
                    let output = serde_json::json!({
                        "key": key.raw(),
                        "capacity": snapshot.capacity,
                        "current_tokens": snapshot.current_tokens,
                        "refill_amount": snapshot.refill_amount,
                        "refill_period_ms": snapshot.refill_period.as_millis() as u64,
                        "last_refill_at": snapshot.last_refill_at.to_rfc3339(),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                None => println!("No stored bucket for {}", key),
            }
        }
        Command::Clear { key } => {
            let key = BucketKey::parse(&key);
            limiter.reset(&key).await?;
            info!(key = %key, "Bucket cleared");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
