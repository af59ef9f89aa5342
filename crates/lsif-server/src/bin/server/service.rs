use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use lsif_server::api::{self, AppState};
use lsif_server::{Backend, ConversionQueue, DiskStore, Scheduler, load_config, queue, telemetry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cli::Args;
use super::signals::shutdown_signal;

/// Runs the server until a shutdown signal arrives or the queue backend
/// fails.
pub async fn run_server(args: Args) -> Result<()> {
    let config = args.apply(load_config(args.config.as_deref())?);
    info!(
        port = config.http_port,
        storage_root = %config.storage_root.display(),
        queue_url = %config.queue_url,
        "Configuration loaded"
    );

    let metrics = if config.metrics_enabled {
        Some(telemetry::install_recorder()?)
    } else {
        None
    };

    let store = Arc::new(
        DiskStore::open(&config.storage_root, config.soft_max_storage, config.max_file_size).await?,
    );
    let swept = store.sweep_temp(config.temp_file_max_age()).await?;
    if swept > 0 {
        info!(count = swept, "Removed stale temp files");
    }
    let backend = Arc::new(Backend::new(store, config.cache_capacity));

    let queue = ConversionQueue::new(
        queue::connect(&config.queue_url).await?,
        config.queue_namespace.clone(),
    );

    let fatal = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        queue.clone(),
        config.scheduler_poll_interval(),
        config.scheduler_lease_ttl(),
        config.stale_worker_timeout(),
    );
    let scheduler_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let fatal = fatal.clone();
        async move {
            let result = scheduler.run(shutdown).await;
            if let Err(e) = &result {
                error!(error = %e, "Scheduler stopped");
                fatal.cancel();
            }
            result
        }
    });

    let app = api::router(AppState {
        backend: backend.clone(),
        queue,
        fatal: fatal.clone(),
        metrics,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let fatal = fatal.clone();
            async move {
                tokio::select! {
                    _ = shutdown_signal() => info!("Shutting down"),
                    _ = fatal.cancelled() => warn!("Queue backend failed, shutting down"),
                }
            }
        })
        .await?;

    shutdown.cancel();
    let scheduler_result = scheduler_task.await;
    backend.shutdown().await;

    if fatal.is_cancelled() {
        return Err(anyhow!("Queue backend unavailable"));
    }
    scheduler_result??;

    info!("Server stopped");
    Ok(())
}
