use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::{ErrorKind, OperationStatus, Step};

/// Outcome recorded with every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Waiting,
    Warning,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Waiting => "waiting",
            AuditOutcome::Warning => "warning",
        }
    }
}

/// Audit event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Operation lifecycle
    OperationCreated {
        operation_id: String,
        requested_by: String,
        target_cluster_id: String,
        snapshot: String,
    },
    OperationStarted {
        operation_id: String,
        executor: String,
    },
    OperationSucceeded {
        operation_id: String,
        duration_secs: i64,
    },
    OperationFailed {
        operation_id: String,
        step: Step,
        kind: ErrorKind,
        message: String,
    },
    CancelRequested {
        operation_id: String,
        requested_by: String,
        previous_status: OperationStatus,
    },
    OperationCancelled {
        operation_id: String,
        step: Step,
        cancelled_by: String,
    },

    // Step transitions
    StepSucceeded {
        operation_id: String,
        step: Step,
        next_step: Step,
        summary: String,
    },
    /// The step advanced but an optional part of it did not complete.
    StepDegraded {
        operation_id: String,
        step: Step,
        next_step: Step,
        warning: String,
    },
    StepWaiting {
        operation_id: String,
        step: Step,
        poll_attempt: u32,
        delay_ms: u64,
        provider_status: String,
    },
    StepFailed {
        operation_id: String,
        step: Step,
        kind: ErrorKind,
        message: String,
        retry_count: u32,
        will_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_delay_ms: Option<u64>,
    },

    // Notifications
    NotificationPublished {
        operation_id: String,
        topic: String,
        status: OperationStatus,
    },
    NotificationFailed {
        operation_id: String,
        topic: String,
        error: String,
    },
}

impl AuditEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::OperationCreated { .. } => "operation_created",
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationSucceeded { .. } => "operation_succeeded",
            Self::OperationFailed { .. } => "operation_failed",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::OperationCancelled { .. } => "operation_cancelled",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepDegraded { .. } => "step_degraded",
            Self::StepWaiting { .. } => "step_waiting",
            Self::StepFailed { .. } => "step_failed",
            Self::NotificationPublished { .. } => "notification_published",
            Self::NotificationFailed { .. } => "notification_failed",
        }
    }

    /// Get the operation ID if this event is related to an operation
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
            Self::OperationCreated { operation_id, .. }
            | Self::OperationStarted { operation_id, .. }
            | Self::OperationSucceeded { operation_id, .. }
            | Self::OperationFailed { operation_id, .. }
            | Self::CancelRequested { operation_id, .. }
            | Self::OperationCancelled { operation_id, .. }
            | Self::StepSucceeded { operation_id, .. }
            | Self::StepDegraded { operation_id, .. }
            | Self::StepWaiting { operation_id, .. }
            | Self::StepFailed { operation_id, .. }
            | Self::NotificationPublished { operation_id, .. }
            | Self::NotificationFailed { operation_id, .. } => Some(operation_id),
        }
    }

    /// The step this event concerns, for step-scoped events
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::OperationFailed { step, .. }
            | Self::OperationCancelled { step, .. }
            | Self::StepSucceeded { step, .. }
            | Self::StepDegraded { step, .. }
            | Self::StepWaiting { step, .. }
            | Self::StepFailed { step, .. } => Some(*step),
            Self::OperationSucceeded { .. } => Some(Step::Done),
            Self::NotificationPublished { .. } | Self::NotificationFailed { .. } => {
                Some(Step::Notify)
            }
            _ => None,
        }
    }

    pub fn outcome(&self) -> AuditOutcome {
        match self {
            Self::StepWaiting { .. } => AuditOutcome::Waiting,
            Self::StepDegraded { .. } | Self::NotificationFailed { .. } => AuditOutcome::Warning,
            Self::StepFailed { .. }
            | Self::OperationFailed { .. }
            | Self::OperationCancelled { .. } => AuditOutcome::Failure,
            _ => AuditOutcome::Success,
        }
    }

    /// Get the user or executor responsible for this event
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::OperationCreated { requested_by, .. }
            | Self::CancelRequested { requested_by, .. } => Some(requested_by),
            Self::OperationCancelled { cancelled_by, .. } => Some(cancelled_by),
            Self::OperationStarted { executor, .. } => Some(executor),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub operation_id: Option<String>,
    /// Position in the operation's trail, assigned by the store. Zero for
    /// service events.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub step: Option<Step>,
    pub outcome: AuditOutcome,
    pub actor: Option<String>,
    pub data: AuditEvent,
}

impl AuditRecord {
    /// Build an unsaved record stamped with the current time.
    pub fn new(event: AuditEvent) -> Self {
        Self::at(Utc::now(), event)
    }

    pub fn at(timestamp: DateTime<Utc>, event: AuditEvent) -> Self {
        Self {
            id: 0,
            operation_id: event.operation_id().map(String::from),
            sequence: 0,
            timestamp,
            event_type: event.event_type().to_string(),
            step: event.step(),
            outcome: event.outcome(),
            actor: event.actor().map(String::from),
            data: event,
        }
    }
}
