use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{AuditOutcome, AuditRecord};
use crate::operation::Step;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Filter for querying audit events
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub operation_id: Option<String>,
    pub event_type: Option<String>,
    pub step: Option<Step>,
    pub outcome: Option<AuditOutcome>,
    /// Who triggered or cancelled the operation.
    pub actor: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            offset: 0,
            ..Default::default()
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Append-only audit trail storage.
pub trait AuditStore: Send + Sync {
    /// Append a record. The store assigns `id` and the next per-operation
    /// `sequence`, and returns the stored record.
    fn append(&self, record: &AuditRecord) -> Result<AuditRecord, AuditError>;

    /// Every record of one operation, ordered by sequence.
    fn events_for(&self, operation_id: &str) -> Result<Vec<AuditRecord>, AuditError>;

    /// Query audit records with optional filters, newest first
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Count matching audit records
    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError>;
}
