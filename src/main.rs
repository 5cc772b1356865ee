use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowgate::config::LimiterSettings;
use windowgate::ratelimit::{Limiter, RateLimiter, WaitContext, Waiter};
use windowgate::LimiterError;

/// Drive a configured rate limiter with synthetic requests.
#[derive(Debug, Parser)]
#[command(name = "windowgate", version, about)]
struct Args {
    /// Settings file (YAML); WINDOWGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Key every request is charged against
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Total number of requests
    #[arg(short = 'n', long, default_value_t = 1000)]
    requests: u64,

    /// Concurrent workers
    #[arg(short = 'j', long, default_value_t = 8)]
    concurrency: usize,

    /// Wait for admission instead of failing fast
    #[arg(short, long)]
    wait: bool,

    /// Per-request wait timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Default)]
struct Tally {
    admitted: AtomicU64,
    denied: AtomicU64,
    cancelled: AtomicU64,
    errors: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = match &args.config {
        Some(path) => LimiterSettings::load(path)?,
        None => LimiterSettings::default(),
    };
    let limiter = settings.build().await?;
    let sweeper = settings
        .sweep_interval()
        .and_then(|interval| limiter.spawn_sweeper(interval));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    info!(
        key = %args.key,
        requests = args.requests,
        concurrency = args.concurrency,
        wait = args.wait,
        "Starting load run"
    );

    let started = Instant::now();
    let tally = run_load(&args, &settings, limiter, cancel).await;
    let elapsed = started.elapsed();

    if let Some(sweeper) = sweeper {
        sweeper.cancel();
    }

    let summary = serde_json::json!({
        "key": args.key,
        "requests": args.requests,
        "admitted": tally.admitted.load(Ordering::Relaxed),
        "denied": tally.denied.load(Ordering::Relaxed),
        "cancelled": tally.cancelled.load(Ordering::Relaxed),
        "errors": tally.errors.load(Ordering::Relaxed),
        "elapsed_ms": elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn run_load(
    args: &Args,
    settings: &LimiterSettings,
    limiter: RateLimiter,
    cancel: CancellationToken,
) -> Arc<Tally> {
    let tally = Arc::new(Tally::default());
    let issued = Arc::new(AtomicU64::new(0));
    let policy = settings.backoff_policy();

    let workers: Vec<_> = (0..args.concurrency.max(1))
        .map(|_| {
            let limiter = limiter.clone();
            let tally = Arc::clone(&tally);
            let issued = Arc::clone(&issued);
            let cancel = cancel.clone();
            let key = args.key.clone();
            let requests = args.requests;
            let wait = args.wait;
            let timeout = args.timeout_ms.map(Duration::from_millis);

            tokio::spawn(async move {
                while issued.fetch_add(1, Ordering::Relaxed) < requests {
                    let outcome = if wait {
                        let mut ctx = WaitContext::new().with_cancel(cancel.clone());
                        if let Some(timeout) = timeout {
                            ctx = ctx.with_timeout(timeout);
                        }
                        Waiter::with_policy(&limiter, policy)
                            .wait(&key, &ctx)
                            .await
                            .map(|()| true)
                    } else if cancel.is_cancelled() {
                        Err(LimiterError::Cancelled)
                    } else {
                        limiter.allow(&key).await
                    };

                    match outcome {
                        Ok(true) => tally.admitted.fetch_add(1, Ordering::Relaxed),
                        Ok(false) | Err(LimiterError::DeadlineExceeded) => {
                            tally.denied.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(LimiterError::Cancelled) => {
                            tally.cancelled.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Request failed");
                            tally.errors.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            })
        })
        .collect();

    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            warn!(error = %e, "Load worker panicked");
        }
    }

    tally
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling outstanding requests");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling outstanding requests");
        }
    }
}
