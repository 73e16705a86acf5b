//! Notification payload and sink trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::{Operation, OperationStatus, Step, StepError};

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Sink misconfigured: {0}")]
    Misconfigured(String),
}

/// Summary published once per operation when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub operation_id: String,
    pub status: OperationStatus,
    /// Step the operation finished on.
    pub step: Step,
    pub subject: String,
    pub target_cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provisioned_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Notification {
    /// Build the summary for an operation ending with `status`.
    pub fn for_operation(operation: &Operation, status: OperationStatus) -> Self {
        let cluster = &operation.parameters.target_cluster_id;
        let subject = match status {
            OperationStatus::Succeeded => format!("Restore of {} succeeded", cluster),
            OperationStatus::Cancelled => format!("Restore of {} cancelled", cluster),
            _ => format!(
                "Restore of {} failed at {}",
                cluster, operation.current_step
            ),
        };
        let outputs = &operation.outputs;
        let restored = outputs.restored_cluster.as_ref();

        Self {
            operation_id: operation.id.clone(),
            status,
            step: operation.current_step,
            subject,
            target_cluster_id: cluster.clone(),
            snapshot_id: outputs.snapshot.as_ref().map(|s| s.snapshot_id.clone()),
            endpoint: restored.map(|r| r.endpoint.clone()),
            port: restored.map(|r| r.port),
            provisioned_users: outputs
                .users
                .as_ref()
                .map(|u| u.usernames.clone())
                .unwrap_or_default(),
            error: operation.last_error.clone(),
            requested_by: operation.requested_by.clone(),
            created_at: operation.created_at,
            finished_at: Utc::now(),
        }
    }
}

/// Destination for operation summaries.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, topic: &str, notification: &Notification) -> Result<(), NotifyError>;
}
