//! Cross-operation audit queries.
//!
//! `GET /operations/{id}/audit` returns one operation's full trail; this
//! endpoint searches every trail at once, e.g. all failed `copy_snapshot`
//! steps of the last day, or everything a given requester triggered.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use clusterback_core::{AuditFilter, AuditOutcome, AuditRecord, Step};
use serde::{Deserialize, Serialize};

use super::operations::{reply, ErrorReply, DEFAULT_LIMIT, MAX_LIMIT};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQueryParams {
    pub operation_id: Option<String>,
    /// e.g. `step_failed`, `cancel_requested`
    pub event_type: Option<String>,
    /// Step name as it appears in audit records, e.g. `check_copy_status`
    pub step: Option<String>,
    pub outcome: Option<AuditOutcome>,
    /// Requester or executor recorded on the event
    pub actor: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQueryParams {
    /// Limit clamped to `1..=MAX_LIMIT` and a non-negative offset.
    fn page(&self) -> (i64, i64) {
        (
            self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            self.offset.unwrap_or(0).max(0),
        )
    }

    /// Filter without pagination, shared by the page query and the count.
    fn filter(&self) -> Result<AuditFilter, String> {
        let mut filter = AuditFilter::new();

        if let Some(ref operation_id) = self.operation_id {
            filter = filter.with_operation_id(operation_id);
        }
        if let Some(ref event_type) = self.event_type {
            filter = filter.with_event_type(event_type);
        }
        if let Some(ref step) = self.step {
            filter = filter.with_step(step.parse::<Step>()?);
        }
        if let Some(outcome) = self.outcome {
            filter = filter.with_outcome(outcome);
        }
        if let Some(ref actor) = self.actor {
            filter = filter.with_actor(actor);
        }
        if self.from.is_some() || self.to.is_some() {
            filter = filter.with_time_range(self.from, self.to);
        }

        Ok(filter)
    }
}

#[derive(Debug, Serialize)]
pub struct AuditQueryResponse {
    pub events: Vec<AuditRecord>,
    /// Matching events ignoring pagination
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Search audit records across operations, newest first
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditQueryResponse>, ErrorReply> {
    let filter = params
        .filter()
        .map_err(|e| reply(StatusCode::BAD_REQUEST, e))?;
    let (limit, offset) = params.page();

    let audit = state.audit_store();
    let events = audit
        .query(&filter.clone().with_limit(limit).with_offset(offset))
        .map_err(|e| reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let total = audit
        .count(&filter)
        .map_err(|e| reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(AuditQueryResponse {
        events,
        total,
        limit,
        offset,
    }))
}
