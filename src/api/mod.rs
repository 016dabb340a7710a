//! HTTP surface: one endpoint that triggers a pipeline run, plus a health probe.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Pipeline;
use crate::error::Result;

/// Shared state handed to every handler.
pub struct AppState {
    pub pipeline: Pipeline,
    /// Deadline for one triggered run. `None` lets runs go to completion.
    pub run_timeout: Option<Duration>,
    /// Cancelled on server shutdown; every run token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Pipeline, run_timeout: Option<Duration>) -> Self {
        Self {
            pipeline,
            run_timeout,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/process",
            get(handlers::process_emails).post(handlers::process_emails),
        )
        .route("/healthz", get(handlers::health))
        .with_state(state)
}

/// Serve until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
