use deviceauth_service::config::DeviceAuthConfig;
use deviceauth_service::services::init_metrics;
use deviceauth_service::startup::{build_router, AppState};
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize metrics recorder (must be before any metrics are recorded)
    init_metrics().map_err(|e| std::io::Error::other(format!("Metrics error: {}", e)))?;

    let config = DeviceAuthConfig::load()
        .map_err(|e| std::io::Error::other(format!("Configuration error: {}", e)))?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        &config.otlp_endpoint,
    )
    .map_err(|e| std::io::Error::other(format!("Tracing error: {}", e)))?;

    let state = AppState::build(config.clone()).await.map_err(|e| {
        tracing::error!("Failed to initialize deviceauth-service: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    let shutdown = CancellationToken::new();
    let reconciler = state.reconciler().spawn(shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind listener to {}: {}", addr, e);
        e
    })?;
    tracing::info!(
        "{} listening on {} (multi-tenant: {})",
        config.service_name,
        addr,
        config.tenantadm.is_some()
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = reconciler.await {
        tracing::error!("Reconciler task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
