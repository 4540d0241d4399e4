use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use analysis_worker::analysis::{AnalysisBackend, HttpAnalysisBackend};
use analysis_worker::broker::{Broker, RedisBroker};
use analysis_worker::config::{AnalysisConfig, WorkerConfig};
use analysis_worker::handlers::default_registry;
use analysis_worker::store::{JobStore, LibSqlJobStore};
use analysis_worker::worker::QueueWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let analysis_config = AnalysisConfig::from_env().context("invalid analysis configuration")?;

    eprintln!("Analysis worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Analysis service: {}", analysis_config.base_url);
    eprintln!("   Max concurrent jobs: {}\n", config.max_concurrent);

    // ── Storage ──────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open job store at {}", config.db_path.display()))?,
    );

    // ── Broker ───────────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis_url, config.poll_timeout)
            .await
            .context("failed to connect to broker")?,
    );

    // ── Handlers ─────────────────────────────────────────────────────────
    let backend: Arc<dyn AnalysisBackend> = Arc::new(HttpAnalysisBackend::new(&analysis_config)?);
    let registry = default_registry(backend);

    // ── Shutdown ─────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    QueueWorker::new(config, store, broker, registry)
        .run(shutdown)
        .await;

    info!("Analysis worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
