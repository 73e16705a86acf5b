//! Restore operation API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use clusterback_core::operation::{EngineOptions, NetworkPlacement};
use clusterback_core::{
    AuditRecord, CreateOperationRequest, DriveOutcome, Location, Operation, OperationFilter,
    OperationStatus, OrchestratorError, RestoreParameters, SnapshotSelector, Step, StepError,
    StepOutputs, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};

use super::middleware::Requester;
use crate::state::AppState;

/// Maximum allowed limit for operation and audit queries
pub(crate) const MAX_LIMIT: i64 = 1000;

/// Default limit for operation queries
pub(crate) const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for triggering a restore
#[derive(Debug, Deserialize)]
pub struct CreateOperationBody {
    /// Caller-chosen id; generated when absent
    pub operation_id: Option<String>,
    pub snapshot: SnapshotSelector,
    pub source_cluster_id: String,
    pub source: Location,
    pub target: Location,
    /// Cluster to restore into; replaced when it already exists
    pub target_cluster_id: String,
    #[serde(default)]
    pub network: NetworkPlacement,
    #[serde(default)]
    pub engine: EngineOptions,
    /// Per-operation setting overrides
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl CreateOperationBody {
    fn validate(&self) -> Result<(), String> {
        if self.target_cluster_id.trim().is_empty() {
            return Err("target_cluster_id cannot be empty".to_string());
        }
        if self.source_cluster_id.trim().is_empty() {
            return Err("source_cluster_id cannot be empty".to_string());
        }
        if let SnapshotSelector::Identifier { ref id } = self.snapshot {
            if id.trim().is_empty() {
                return Err("snapshot id cannot be empty".to_string());
            }
        }
        if self.operation_id.as_ref().is_some_and(|id| id.trim().is_empty()) {
            return Err("operation_id cannot be empty".to_string());
        }
        Ok(())
    }

    fn into_request(self, requested_by: String) -> CreateOperationRequest {
        CreateOperationRequest {
            operation_id: self.operation_id,
            requested_by,
            parameters: RestoreParameters {
                snapshot: self.snapshot,
                source_cluster_id: self.source_cluster_id,
                source: self.source,
                target: self.target,
                target_cluster_id: self.target_cluster_id,
                network: self.network,
                engine: self.engine,
                options: self.options,
            },
        }
    }
}

/// Query parameters for listing operations
#[derive(Debug, Deserialize)]
pub struct ListOperationsParams {
    /// Filter by status (e.g. "waiting", "failed")
    pub status: Option<String>,
    pub requested_by: Option<String>,
    pub target_cluster_id: Option<String>,
    /// Created at or after (ISO 8601)
    pub from: Option<DateTime<Utc>>,
    /// Created at or before (ISO 8601)
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Optional body for cancellation
#[derive(Debug, Deserialize)]
pub struct CancelOperationBody {
    /// Overrides the requester header
    pub requested_by: Option<String>,
}

/// Query parameters for resume
#[derive(Debug, Deserialize)]
pub struct ResumeParams {
    /// Drive inline and report the outcome instead of returning immediately
    #[serde(default)]
    pub wait: bool,
}

/// Response for operation endpoints
#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub id: String,
    pub requested_by: String,
    pub status: OperationStatus,
    pub current_step: Step,
    pub retry_count: u32,
    pub poll_attempt: u32,
    pub last_error: Option<StepError>,
    pub next_run_at: Option<String>,
    pub cancel_requested_by: Option<String>,
    pub parameters: RestoreParameters,
    pub outputs: StepOutputs,
    pub step_started_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: u64,
}

impl From<Operation> for OperationResponse {
    fn from(operation: Operation) -> Self {
        Self {
            id: operation.id,
            requested_by: operation.requested_by,
            status: operation.status,
            current_step: operation.current_step,
            retry_count: operation.retry_count,
            poll_attempt: operation.poll_attempt,
            last_error: operation.last_error,
            next_run_at: operation.next_run_at.map(|at| at.to_rfc3339()),
            cancel_requested_by: operation.cancel_requested_by,
            parameters: operation.parameters,
            outputs: operation.outputs,
            step_started_at: operation.step_started_at.to_rfc3339(),
            created_at: operation.created_at.to_rfc3339(),
            updated_at: operation.updated_at.to_rfc3339(),
            version: operation.version,
        }
    }
}

/// Response for listing operations
#[derive(Debug, Serialize)]
pub struct ListOperationsResponse {
    pub operations: Vec<OperationResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Ordered audit trail of one operation
#[derive(Debug, Serialize)]
pub struct OperationAuditResponse {
    pub operation_id: String,
    pub events: Vec<AuditRecord>,
}

/// Response for resume
#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub operation_id: String,
    /// Present when the drive ran inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DriveOutcome>,
    pub operation: OperationResponse,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct OperationErrorResponse {
    pub error: String,
}

pub(crate) type ErrorReply = (StatusCode, Json<OperationErrorResponse>);

pub(crate) fn reply(status: StatusCode, error: impl Into<String>) -> ErrorReply {
    (
        status,
        Json(OperationErrorResponse {
            error: error.into(),
        }),
    )
}

fn error_reply(err: OrchestratorError) -> ErrorReply {
    match err {
        OrchestratorError::OperationNotFound(id) => {
            reply(StatusCode::NOT_FOUND, format!("Operation not found: {}", id))
        }
        OrchestratorError::InvalidState { .. } => reply(StatusCode::CONFLICT, err.to_string()),
        OrchestratorError::Store(StoreError::AlreadyExists(id)) => reply(
            StatusCode::CONFLICT,
            format!("Operation already exists: {}", id),
        ),
        OrchestratorError::Store(StoreError::NotFound(id)) => {
            reply(StatusCode::NOT_FOUND, format!("Operation not found: {}", id))
        }
        other => {
            error!(error = %other, "Operation request failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Trigger a new restore operation
pub async fn create_operation(
    State(state): State<Arc<AppState>>,
    Requester(requested_by): Requester,
    Json(body): Json<CreateOperationBody>,
) -> Result<(StatusCode, Json<OperationResponse>), impl IntoResponse> {
    if let Err(message) = body.validate() {
        return Err(reply(StatusCode::BAD_REQUEST, message));
    }

    match state.orchestrator().submit(body.into_request(requested_by)) {
        Ok(operation) => Ok((StatusCode::CREATED, Json(OperationResponse::from(operation)))),
        Err(e) => Err(error_reply(e)),
    }
}

/// Get an operation by ID
pub async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>, impl IntoResponse> {
    match state.orchestrator().get(&id) {
        Ok(operation) => Ok(Json(OperationResponse::from(operation))),
        Err(e) => Err(error_reply(e)),
    }
}

/// List operations with optional filters
pub async fn list_operations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListOperationsParams>,
) -> Result<Json<ListOperationsResponse>, impl IntoResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = OperationFilter::new().with_limit(limit).with_offset(offset);

    if let Some(ref status) = params.status {
        match status.parse::<OperationStatus>() {
            Ok(status) => filter = filter.with_status(status),
            Err(e) => return Err(reply(StatusCode::BAD_REQUEST, e)),
        }
    }

    if let Some(ref requested_by) = params.requested_by {
        filter = filter.with_requested_by(requested_by);
    }

    if let Some(ref cluster_id) = params.target_cluster_id {
        filter = filter.with_target_cluster(cluster_id);
    }

    if params.from.is_some() || params.to.is_some() {
        filter = filter.with_time_range(params.from, params.to);
    }

    let operations = match state.operation_store().list(&filter) {
        Ok(operations) => operations,
        Err(e) => return Err(reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    // Total ignores pagination
    let count_filter = OperationFilter {
        limit: i64::MAX,
        offset: 0,
        ..filter.clone()
    };

    let total = match state.operation_store().count(&count_filter) {
        Ok(count) => count,
        Err(e) => return Err(reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    Ok(Json(ListOperationsResponse {
        operations: operations.into_iter().map(OperationResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

/// Ordered audit trail of an operation
pub async fn operation_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationAuditResponse>, impl IntoResponse> {
    if let Err(e) = state.orchestrator().get(&id) {
        return Err(error_reply(e));
    }

    match state.audit_store().events_for(&id) {
        Ok(events) => Ok(Json(OperationAuditResponse {
            operation_id: id,
            events,
        })),
        Err(e) => Err(reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read audit trail: {}", e),
        )),
    }
}

/// Request cancellation. Takes effect at the next step boundary.
pub async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Requester(requester): Requester,
    body: Option<Json<CancelOperationBody>>,
) -> Result<Json<OperationResponse>, impl IntoResponse> {
    let requested_by = body
        .and_then(|Json(b)| b.requested_by)
        .unwrap_or(requester);

    match state.orchestrator().cancel(&id, &requested_by) {
        Ok(operation) => Ok(Json(OperationResponse::from(operation))),
        Err(e) => Err(error_reply(e)),
    }
}

/// Drive an operation now, skipping any pending delay.
///
/// Without `?wait=true` the drive runs in the background and the current
/// state is returned with 202.
pub async fn resume_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ResumeParams>,
) -> Result<(StatusCode, Json<ResumeResponse>), impl IntoResponse> {
    let orchestrator = Arc::clone(state.orchestrator());

    let operation = match orchestrator.get(&id) {
        Ok(operation) => operation,
        Err(e) => return Err(error_reply(e)),
    };
    if operation.status.is_terminal() {
        return Err(error_reply(OrchestratorError::InvalidState {
            operation_id: id,
            status: operation.status,
            action: "resume".to_string(),
        }));
    }

    if params.wait {
        let outcome = match orchestrator.resume(&id).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(error_reply(e)),
        };
        let operation = match orchestrator.get(&id) {
            Ok(operation) => operation,
            Err(e) => return Err(error_reply(e)),
        };
        return Ok((
            StatusCode::OK,
            Json(ResumeResponse {
                operation_id: id,
                outcome: Some(outcome),
                operation: OperationResponse::from(operation),
            }),
        ));
    }

    let background = Arc::clone(&orchestrator);
    let operation_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = background.resume(&operation_id).await {
            warn!(operation_id = %operation_id, error = %e, "Background resume failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ResumeResponse {
            operation_id: id,
            outcome: None,
            operation: OperationResponse::from(operation),
        }),
    ))
}
