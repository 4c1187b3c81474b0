use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use pairline::config::Settings;
use pairline::server::{create_app, AppState};
use pairline::shutdown::{GracefulShutdown, ShutdownConfig};
use pairline::tasks::{HeartbeatTask, MaintenanceTask};
use pairline::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;
    tracing::info!("Configuration loaded");

    let state = AppState::new(settings.clone());
    tracing::info!(
        max_connections = settings.limits.max_connections,
        max_connections_per_ip = settings.limits.max_connections_per_ip,
        "Application state initialized"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.core.clone(),
        shutdown_tx.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat_task.run());

    let maintenance_task = MaintenanceTask::new(
        &settings.matchmaking,
        &settings.websocket,
        state.core.clone(),
        state.health.clone(),
        shutdown_tx.subscribe(),
    );
    let maintenance_handle = tokio::spawn(maintenance_task.run());

    let shutdown = GracefulShutdown::with_config(
        state.core.clone(),
        shutdown_tx.clone(),
        ShutdownConfig::from(&settings.shutdown),
    );

    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Drain runs inside the signal future so clients are told before axum stops serving
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.execute("server_shutdown").await;
        })
        .await?;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(heartbeat_handle, maintenance_handle);

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
