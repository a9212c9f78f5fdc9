use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use portwatch_rs::scanner::{ProbeOptions, TcpProber};
use portwatch_rs::scheduler::{RetentionPolicy, SchedulerManager};
use portwatch_rs::server;
use portwatch_rs::store::{InMemoryStore, JobStore, SqliteStore};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// portwatch-rs: recurring TCP port-range watcher with a small JSON API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portwatch-rs",
    version,
    about = "Recurring TCP port-range watcher with persisted results and a small JSON API.",
    long_about = None
)]
struct Cli {
    /// SQLite database file holding jobs and scan results.
    #[arg(long, env = "PORTWATCH_DB", default_value = "portwatch.db")]
    db: PathBuf,

    /// Keep everything in memory instead of the database file.
    #[arg(long, default_value_t = false)]
    memory: bool,

    /// Address the HTTP API listens on.
    #[arg(long, env = "PORTWATCH_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Max concurrent TCP connect attempts per sweep.
    #[arg(long, default_value_t = 1000)]
    concurrency: usize,

    /// Per-port connect timeout in milliseconds.
    #[arg(long = "probe-timeout-ms", default_value_t = 5000)]
    probe_timeout_ms: u64,

    /// Closed-port rows older than this are pruned.
    #[arg(long = "retention-minutes", default_value_t = 60)]
    retention_minutes: u64,

    /// How often the pruning pass runs.
    #[arg(long = "cleanup-interval-secs", default_value_t = 3600)]
    cleanup_interval_secs: u64,

    /// Directory of static UI files served under `/`.
    #[arg(long = "ui-dir")]
    ui_dir: Option<PathBuf>,

    /// Upper bound on how long shutdown waits for in-flight sweeps, in seconds.
    #[arg(long = "shutdown-timeout-secs", default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    println!("portwatch-rs configuration:");
    println!(
        "  store        : {}",
        if cli.memory {
            "<in-memory>".to_string()
        } else {
            cli.db.display().to_string()
        }
    );
    println!("  bind         : {}", cli.bind);
    println!("  concurrency  : {}", cli.concurrency);
    println!("  timeout_ms   : {}", cli.probe_timeout_ms);
    println!("  retention    : {} min", cli.retention_minutes);
    println!(
        "  ui_dir       : {}",
        cli.ui_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let store: Arc<dyn JobStore> = if cli.memory {
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(
            SqliteStore::new(&cli.db)
                .await
                .with_context(|| format!("failed to open database {}", cli.db.display()))?,
        )
    };

    let prober = TcpProber::new(ProbeOptions {
        timeout: Duration::from_millis(cli.probe_timeout_ms),
        max_concurrency: cli.concurrency,
    });

    let shutdown = CancellationToken::new();
    let manager = Arc::new(SchedulerManager::new(store, Arc::new(prober)));

    if let Err(e) = manager.load_and_start_all().await {
        error!(error = %e, "failed to load persisted jobs");
    }
    manager.spawn_retention_cleanup(RetentionPolicy {
        max_age: Duration::from_secs(cli.retention_minutes * 60),
        every: Duration::from_secs(cli.cleanup_interval_secs),
    });

    let app = server::router(manager.clone(), cli.ui_dir.clone());
    let server_task = {
        let bind = cli.bind.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, app, shutdown.clone()).await {
                error!("HTTP server error: {e:#}");
                shutdown.cancel();
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    let grace = Duration::from_secs(cli.shutdown_timeout_secs);
    if tokio::time::timeout(grace, manager.stop_all()).await.is_err() {
        warn!(?grace, "sweeps still running at shutdown deadline");
    }
    let _ = server_task.await;
    info!("server stopped");
    Ok(())
}
