pub mod routes;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Extension, Router};
use tracing::info;

use crate::crawler::JobQueue;
use crate::events::EventBus;
use crate::storage::CorpusStorage;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub storage: CorpusStorage,
    pub events: EventBus,
    /// Records older than this many days are considered stale
    pub stale_after_days: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/crawl", post(routes::submit_city))
        .route("/api/submit", post(routes::submit_url))
        .route("/api/update", post(routes::trigger_update))
        .route("/api/status", get(routes::status))
        .route("/api/cities", get(routes::cities))
        .route("/api/stats", get(routes::stats))
        .route("/api/stream", get(stream::stream_handler))
        .layer(Extension(state))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind {addr}"))?;
    info!("Control API listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
    }
    info!("Shutdown signal received");
}
