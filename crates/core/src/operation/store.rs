//! Operation storage trait and types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Operation, OperationStatus, RestoreParameters};

/// Error type for operation storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Operation already exists: {0}")]
    AlreadyExists(String),

    /// The stored version moved on since the caller read the operation.
    #[error("Version conflict on operation {operation_id}: expected {expected}, found {actual}")]
    VersionConflict {
        operation_id: String,
        expected: u64,
        actual: u64,
    },

    /// Another executor holds an unexpired lease.
    #[error("Operation {operation_id} is leased by {holder} until {expires_at}")]
    LeaseConflict {
        operation_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Request to create a new operation.
#[derive(Debug, Clone)]
pub struct CreateOperationRequest {
    /// Caller-supplied id. A UUID v4 is generated when absent.
    pub operation_id: Option<String>,
    pub requested_by: String,
    pub parameters: RestoreParameters,
}

/// Filter for querying operations.
#[derive(Debug, Clone)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub requested_by: Option<String>,
    pub target_cluster_id: Option<String>,
    /// Created at or after.
    pub from: Option<DateTime<Utc>>,
    /// Created at or before.
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            status: None,
            requested_by: None,
            target_cluster_id: None,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = Some(requested_by.into());
        self
    }

    pub fn with_target_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.target_cluster_id = Some(cluster_id.into());
        self
    }

    /// Filter by creation time range.
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

/// An exclusive, expiring claim on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub operation_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Trait for operation storage backends.
///
/// Every write after `create` goes through `conditional_update`, which only
/// applies when the stored version still equals `expected_version`.
pub trait OperationStore: Send + Sync {
    /// Create a new pending operation at the first step.
    fn create(&self, request: CreateOperationRequest) -> Result<Operation, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Operation>, StoreError>;

    /// Persist `operation` if the stored version equals `expected_version`.
    /// Returns the stored operation with its bumped version.
    fn conditional_update(
        &self,
        operation: &Operation,
        expected_version: u64,
    ) -> Result<Operation, StoreError>;

    /// Permanently delete an operation and its lease.
    fn delete(&self, id: &str) -> Result<Operation, StoreError>;

    /// List operations matching the filter, newest first.
    fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>, StoreError>;

    fn count(&self, filter: &OperationFilter) -> Result<i64, StoreError>;

    /// Non-terminal operations whose `next_run_at` is unset or not after `now`.
    fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Operation>, StoreError>;

    /// Acquire or re-affirm a lease. Fails with `LeaseConflict` while another
    /// owner's lease is unexpired.
    fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<Lease, StoreError>;

    /// Release a lease held by `owner`. Releasing a lease not held is a no-op.
    fn release_lease(&self, id: &str, owner: &str) -> Result<(), StoreError>;
}
