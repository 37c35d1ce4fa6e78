#![doc = include_str!("../README.md")]

mod runner;

use clap::Parser;
use runner::config::{CliArgs, RunnerConfig};
use runner::telemetry::init_telemetry;
use runner::workload::{self, Summary};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunnerConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let done = CancellationToken::new();
    tokio::spawn(shutdown_signal(done.clone()));

    let summary = workload::run(config, done).await?;
    log_summary(&summary);

    if !summary.is_consistent() {
        anyhow::bail!(
            "Handled {} jobs but {} were accepted",
            summary.stats.handled(),
            summary.submitted
        );
    }
    Ok(())
}

fn log_startup_info(config: &RunnerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting workload with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting {} jobs on {} dispatchers of {} workers",
            config.jobs,
            config.pool.init_dispatchers,
            config.pool.workers
        );
    }
}

fn log_summary(summary: &Summary) {
    tracing::info!(
        submitted = summary.submitted,
        completed = summary.stats.completed,
        failed = summary.stats.failed,
        errors_received = summary.errors_received,
        "Pool closed after {:.2?} ({:.0} jobs/s)",
        summary.elapsed,
        summary.throughput()
    );
    tracing::info!(
        "Sum of submitted payloads {}, of successfully handled payloads {}",
        summary.submitted_sum,
        summary.handled_sum
    );
    tracing::debug!(
        "Workers stopped: {}, dispatchers stopped: {}, busy time: {:.2?}",
        summary.stats.workers_stopped,
        summary.stats.dispatchers_stopped,
        summary.stats.busy
    );
}

/// Cancels `done` on Ctrl+C or SIGTERM. The pool then drains every queued
/// job before closing.
async fn shutdown_signal(done: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = done.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, draining pool...");
    done.cancel();
}
