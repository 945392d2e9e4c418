//! Read-only HTTP surface for external monitoring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::error;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::InferenceOrchestrator;
use crate::types::NodeStatus;

#[derive(Debug, Clone)]
pub struct ServerParams {
    pub host: String,
    pub port: u16,
}

pub fn server_router(orchestrator: Arc<InferenceOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .fallback(handler_404)
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "UP"
}

async fn status(State(orchestrator): State<Arc<InferenceOrchestrator>>) -> Json<NodeStatus> {
    Json(orchestrator.status().await)
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "The requested resource was not found")
}

/// Binds the status server and serves it on a background task. Returns the
/// bound address (useful with port 0).
pub async fn setup_server(
    orchestrator: Arc<InferenceOrchestrator>,
    params: &ServerParams,
) -> OrchestratorResult<SocketAddr> {
    let address = format!("{}:{}", params.host, params.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| OrchestratorError::Server(format!("failed to bind {address}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| OrchestratorError::Server(format!("failed to read bound address: {e}")))?;

    let app = server_router(orchestrator);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server terminated");
        }
    });

    Ok(bound)
}
