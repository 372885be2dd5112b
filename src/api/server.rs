use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::services::{download_job, health, job_status, list_jobs, submit_job};
use super::state::AppState;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Build the API router. Exposed separately so tests can drive it with
/// `tower::ServiceExt::oneshot` without binding a socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{job_id}", get(job_status))
        .route("/jobs/{job_id}/download", post(download_job))
        .route("/health", get(health))
        .with_state(state)
        .layer(RequestDecompressionLayer::new())
}

pub async fn run(address: SocketAddr, state: AppState) -> Result<(), AnyError> {
    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "farmhand API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
