mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::worker_tick::WorkerTick;
use crate::state::AppState;
use backup_engine::Worker;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting backup scheduler on port {}", config.port);

    let engine_config = backup_engine::Config::load(config.engine_config.as_deref())?;
    tracing::info!(
        worker_id = %engine_config.worker.id,
        data_dir = %engine_config.worker.data_dir.display(),
        destinations = engine_config.destinations.len(),
        "Engine configured"
    );
    let worker = tokio::task::spawn_blocking(move || Worker::open(engine_config)).await??;

    // Build application state
    let state = Arc::new(AppState::new(config.clone(), worker));
    let cancel = CancellationToken::new();

    // Initialize cron ticking
    let ticker = match WorkerTick::new(state.clone()).await {
        Ok(t) => {
            if let Err(e) = t.init().await {
                tracing::warn!("Failed to schedule worker tick: {}", e);
            }
            if let Err(e) = t.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(t)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(t) = ticker {
        if let Err(e) = t.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // A run in flight finishes its current budget; its job stays resumable.
    while state.is_busy() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    tracing::info!("Scheduler stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
