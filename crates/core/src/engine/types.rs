//! Types for the restore orchestrator.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::{ErrorKind, OperationStatus, Step, StepOutput};
use crate::provision::ProvisionError;
use crate::resource::ResourceError;
use crate::secrets::SecretError;

/// Errors that can occur during orchestration.
///
/// Step failures are not errors at this level; they are recorded on the
/// operation. These are failures to read or persist state.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Operation not found.
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// Invalid operation status for the request.
    #[error("cannot {action} operation {operation_id}: status is {status}")]
    InvalidState {
        operation_id: String,
        status: OperationStatus,
        action: String,
    },

    /// Operation store error.
    #[error("operation store error: {0}")]
    Store(#[from] crate::operation::StoreError),

    /// Audit store error.
    #[error("audit store error: {0}")]
    Audit(#[from] crate::audit::AuditError),
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientProviderError, message)
    }

    pub fn provider_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderFailure, message)
    }

    pub fn poll_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PollExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ResourceError> for StepFailure {
    fn from(e: ResourceError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<SecretError> for StepFailure {
    fn from(e: SecretError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ProvisionError> for StepFailure {
    fn from(e: ProvisionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Result of one step handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished; record its output and move on.
    Advance(StepOutput),
    /// The step finished but part of it did not; advance with a warning.
    Degraded { output: StepOutput, warning: String },
    /// Check again later. `status` is the provider status observed.
    Wait { delay: Duration, status: String },
    Fail(StepFailure),
}

/// What a single `drive` call achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriveOutcome {
    /// Waiting for a poll interval or retry backoff.
    Suspended { step: Step, until: DateTime<Utc> },
    Succeeded,
    Failed { step: Step, kind: ErrorKind },
    Cancelled { step: Step },
    /// Another executor holds the lease; nothing was done.
    LeaseConflict { holder: String },
    /// Another writer changed the operation; this executor stopped.
    Superseded,
    /// Nothing to do.
    AlreadyTerminal { status: OperationStatus },
}

impl DriveOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriveOutcome::Succeeded
                | DriveOutcome::Failed { .. }
                | DriveOutcome::Cancelled { .. }
                | DriveOutcome::AlreadyTerminal { .. }
        )
    }
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether the worker loop is running.
    pub running: bool,
    /// Executor identity used for leases.
    pub executor_id: String,
    /// Operations this executor is driving right now.
    pub in_flight: usize,
    pub pending_count: usize,
    pub in_progress_count: usize,
    pub waiting_count: usize,
    pub cancelling_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_from_resource_error() {
        let failure = StepFailure::from(ResourceError::NotFound("snap-1".to_string()));
        assert_eq!(failure.kind, ErrorKind::NotFound);
        assert!(!failure.is_retryable());
        assert!(failure.message.contains("snap-1"));
    }

    #[test]
    fn test_failure_from_provision_error() {
        let failure = StepFailure::from(ProvisionError::ConnectionTimeout {
            endpoint: "db:5432".to_string(),
        });
        assert_eq!(failure.kind, ErrorKind::ConnectionTimeout);
        assert!(failure.is_retryable());
    }

    #[test]
    fn test_drive_outcome_terminal() {
        assert!(DriveOutcome::Succeeded.is_terminal());
        assert!(!DriveOutcome::Superseded.is_terminal());
        assert!(!DriveOutcome::LeaseConflict {
            holder: "w".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::OperationNotFound("op-456".to_string());
        assert_eq!(err.to_string(), "operation not found: op-456");

        let err = OrchestratorError::InvalidState {
            operation_id: "op-1".to_string(),
            status: OperationStatus::Succeeded,
            action: "cancel".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot cancel operation op-1: status is succeeded"
        );
    }
}
