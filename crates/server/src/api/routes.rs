use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{audit, handlers, middleware::metrics_middleware, operations, orchestrator};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health, config and metrics
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::metrics))
        // Audit
        .route("/audit", get(audit::query_audit))
        // Operations
        .route("/operations", post(operations::create_operation))
        .route("/operations", get(operations::list_operations))
        .route("/operations/{id}", get(operations::get_operation))
        .route("/operations/{id}/audit", get(operations::operation_audit))
        .route("/operations/{id}/cancel", post(operations::cancel_operation))
        .route("/operations/{id}/resume", post(operations::resume_operation))
        // Orchestrator
        .route("/orchestrator/status", get(orchestrator::get_status))
        .route("/orchestrator/start", post(orchestrator::start))
        .route("/orchestrator/stop", post(orchestrator::stop))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
