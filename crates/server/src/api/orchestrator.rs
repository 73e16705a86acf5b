//! Orchestrator API handlers.

use axum::{extract::State, Json};
use clusterback_core::OrchestratorStatus;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// Simple message response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Worker loop state plus operation counts by status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator().status().await)
}

/// Start the worker loop. Starting a running loop is a no-op.
pub async fn start(State(state): State<Arc<AppState>>) -> Json<MessageResponse> {
    state.orchestrator().start().await;
    Json(MessageResponse {
        message: "Orchestrator started".to_string(),
    })
}

/// Stop the worker loop. Operations in flight keep their leases until they expire.
pub async fn stop(State(state): State<Arc<AppState>>) -> Json<MessageResponse> {
    state.orchestrator().stop().await;
    Json(MessageResponse {
        message: "Orchestrator stopped".to_string(),
    })
}
