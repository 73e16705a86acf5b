//! Types for the resource control service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::{EngineOptions, ErrorKind, Location, NetworkPlacement};

/// Errors from the resource control service.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResourceError {
    /// Failure classification used by the orchestrator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::NotFound(_) => ErrorKind::NotFound,
            ResourceError::Transient(_) => ErrorKind::TransientProviderError,
            ResourceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ResourceError::AuthenticationFailed(_) => ErrorKind::AuthError,
            ResourceError::Timeout => ErrorKind::ConnectionTimeout,
            ResourceError::Rejected(_) => ErrorKind::ProviderFailure,
            ResourceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A snapshot as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub arn: String,
    /// Provider status, e.g. "available" or "creating".
    pub status: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A cluster as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub status: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Handle of an asynchronous provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub operation_ref: String,
    pub resource_id: String,
}

/// Observed status of an asynchronous provider operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    /// Provider vocabulary, classified by the status poller.
    pub status: String,
    #[serde(default)]
    pub resource_arn: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Provider message accompanying a failure.
    #[serde(default)]
    pub detail: Option<String>,
}

impl RemoteStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            resource_arn: None,
            endpoint: None,
            port: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopySnapshotRequest {
    pub source_arn: String,
    pub source: Location,
    pub target: Location,
    pub target_snapshot_id: String,
    pub idempotency_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteClusterRequest {
    pub cluster_id: String,
    pub location: Location,
    pub skip_final_snapshot: bool,
    pub idempotency_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreClusterRequest {
    pub cluster_id: String,
    pub snapshot_arn: String,
    pub location: Location,
    pub network: NetworkPlacement,
    pub engine: EngineOptions,
    pub idempotency_token: String,
}

/// Resource control service trait.
///
/// Start calls carry an idempotency token: repeating a start with the same
/// token must return the handle of the operation already started.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    /// Get the backend name.
    fn name(&self) -> &str;

    async fn describe_snapshot(
        &self,
        snapshot_id: &str,
        location: &Location,
    ) -> Result<SnapshotInfo, ResourceError>;

    async fn start_copy(
        &self,
        request: &CopySnapshotRequest,
    ) -> Result<OperationHandle, ResourceError>;

    async fn poll_copy(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError>;

    /// Look up a cluster. `Ok(None)` when no cluster has this id.
    async fn describe_cluster(
        &self,
        cluster_id: &str,
        location: &Location,
    ) -> Result<Option<ClusterInfo>, ResourceError>;

    async fn start_delete(
        &self,
        request: &DeleteClusterRequest,
    ) -> Result<OperationHandle, ResourceError>;

    async fn poll_delete(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError>;

    async fn start_restore(
        &self,
        request: &RestoreClusterRequest,
    ) -> Result<OperationHandle, ResourceError>;

    async fn poll_restore(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError>;

    async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        location: &Location,
    ) -> Result<(), ResourceError>;
}
