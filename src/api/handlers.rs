//! Request handlers for the trigger endpoint and the health probe.
//!
//! Bodies are JSON. A processing run always answers with a count unless it
//! failed before anything was dispatched.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub status: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Run the pipeline once and report how many emails were processed.
///
/// A run that stopped after dispatching work still reports its count. Only
/// a run that failed before anything was dispatched is an error response.
pub async fn process_emails(State(state): State<Arc<AppState>>) -> Response {
    info!("processing emails");

    // Dropping this handler (client went away) cancels the run.
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let deadline = state.run_timeout.map(|timeout| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(timeout_secs = timeout.as_secs(), "run deadline reached, cancelling");
            cancel.cancel();
        })
    });

    let result = state.pipeline.run_once(&cancel).await;

    if let Some(deadline) = deadline {
        deadline.abort();
    }

    match result {
        Ok(summary) => (
            StatusCode::OK,
            Json(ProcessResponse {
                status: "emails processed".to_string(),
                count: summary.processed,
                message: None,
            }),
        )
            .into_response(),
        Err(e) if e.dispatched_any() => (
            StatusCode::OK,
            Json(ProcessResponse {
                status: "emails partially processed".to_string(),
                count: e.processed,
                message: Some(e.source.to_string()),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.source.kind().to_string(),
                message: e.source.to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.kind().to_string(),
                message: e.to_string(),
            }),
        )
            .into_response(),
    }
}
