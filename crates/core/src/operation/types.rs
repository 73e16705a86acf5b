//! Core operation data types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Steps
// ============================================================================

/// A node of the fixed restore graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CheckSnapshot,
    CopySnapshot,
    CheckCopyStatus,
    DeleteTargetCluster,
    CheckDeleteStatus,
    RestoreCluster,
    CheckRestoreStatus,
    ProvisionUsers,
    ArchiveSnapshot,
    Notify,
    Done,
}

impl Step {
    /// Every step, in graph order.
    pub const ALL: [Step; 11] = [
        Step::CheckSnapshot,
        Step::CopySnapshot,
        Step::CheckCopyStatus,
        Step::DeleteTargetCluster,
        Step::CheckDeleteStatus,
        Step::RestoreCluster,
        Step::CheckRestoreStatus,
        Step::ProvisionUsers,
        Step::ArchiveSnapshot,
        Step::Notify,
        Step::Done,
    ];

    /// Stable string form used in storage, audit records and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CheckSnapshot => "check_snapshot",
            Step::CopySnapshot => "copy_snapshot",
            Step::CheckCopyStatus => "check_copy_status",
            Step::DeleteTargetCluster => "delete_target_cluster",
            Step::CheckDeleteStatus => "check_delete_status",
            Step::RestoreCluster => "restore_cluster",
            Step::CheckRestoreStatus => "check_restore_status",
            Step::ProvisionUsers => "provision_users",
            Step::ArchiveSnapshot => "archive_snapshot",
            Step::Notify => "notify",
            Step::Done => "done",
        }
    }

    /// Whether the step polls an asynchronous provider operation.
    pub fn is_poll(&self) -> bool {
        matches!(
            self,
            Step::CheckCopyStatus | Step::CheckDeleteStatus | Step::CheckRestoreStatus
        )
    }

    /// Position in graph order, used to check monotonic progress.
    pub fn ordinal(&self) -> usize {
        Step::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .iter()
            .find(|step| step.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown step: {}", s))
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created, not yet picked up by an executor.
    Pending,
    /// An executor is working through steps.
    InProgress,
    /// Suspended until `next_run_at` (poll interval or retry backoff).
    Waiting,
    /// Cancellation requested; the next executor pass ends the operation.
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Waiting => "waiting",
            OperationStatus::Cancelling => "cancelling",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::InProgress | OperationStatus::Waiting
        )
    }

    /// Statuses an executor should still drive.
    pub fn active() -> [OperationStatus; 4] {
        [
            OperationStatus::Pending,
            OperationStatus::InProgress,
            OperationStatus::Waiting,
            OperationStatus::Cancelling,
        ]
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "waiting" => Ok(OperationStatus::Waiting),
            "cancelling" => Ok(OperationStatus::Cancelling),
            "succeeded" => Ok(OperationStatus::Succeeded),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(format!("unknown operation status: {}", other)),
        }
    }
}

// ============================================================================
// Errors recorded on the operation
// ============================================================================

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    TransientProviderError,
    AuthError,
    PermissionDenied,
    ConnectionTimeout,
    PollExhausted,
    ProviderFailure,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientProviderError => "transient_provider_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::PollExhausted => "poll_exhausted",
            ErrorKind::ProviderFailure => "provider_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Only transient provider errors and connection timeouts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientProviderError | ErrorKind::ConnectionTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent failure observed on an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step: Step,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Parameters
// ============================================================================

/// How the source snapshot is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotSelector {
    /// An explicit snapshot identifier.
    Identifier { id: String },
    /// A date resolved through the snapshot naming template.
    Date { date: NaiveDate },
}

/// An account/region pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub account: String,
    pub region: String,
}

impl Location {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Network placement of the restored cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlacement {
    pub subnet_group: String,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub publicly_accessible: bool,
}

/// Engine options for the restored cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_group: Option<String>,
    #[serde(default)]
    pub deletion_protection: bool,
}

/// Immutable input of a restore operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreParameters {
    pub snapshot: SnapshotSelector,
    /// Cluster the snapshot was taken from. Used by the naming template.
    pub source_cluster_id: String,
    pub source: Location,
    pub target: Location,
    /// Cluster id to restore into. An existing cluster with this id is replaced.
    pub target_cluster_id: String,
    pub network: NetworkPlacement,
    pub engine: EngineOptions,
    /// Free-form overrides; the highest-priority configuration layer.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl RestoreParameters {
    /// Whether the copy crosses an account or region boundary.
    pub fn is_cross_location(&self) -> bool {
        self.source != self.target
    }
}

// ============================================================================
// Step outputs
// ============================================================================

/// A snapshot as described by the resource control service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub snapshot_id: String,
    pub arn: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Reference to an asynchronous provider operation started by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncOperationRef {
    pub operation_ref: String,
    /// Id of the resource being created or deleted.
    pub resource_id: String,
    pub idempotency_token: String,
    pub started_at: DateTime<Utc>,
}

/// Result of a finished snapshot copy, plus the target cluster probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedSnapshot {
    pub snapshot_id: String,
    pub arn: String,
    /// Whether a cluster with the target id already existed after the copy.
    pub target_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedCluster {
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredCluster {
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    pub endpoint: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedUsers {
    pub usernames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub snapshot_id: String,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub topic: String,
    pub delivered: bool,
    pub published_at: DateTime<Utc>,
}

/// The output a single step contributes to the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    Snapshot(SnapshotDescriptor),
    CopyRequest(AsyncOperationRef),
    CopiedSnapshot(CopiedSnapshot),
    DeleteRequest(AsyncOperationRef),
    DeletedCluster(DeletedCluster),
    RestoreRequest(AsyncOperationRef),
    RestoredCluster(RestoredCluster),
    Users(ProvisionedUsers),
    Archive(ArchiveResult),
    Notification(NotificationReceipt),
}

impl StepOutput {
    /// The step whose slot this output fills.
    pub fn step(&self) -> Step {
        match self {
            StepOutput::Snapshot(_) => Step::CheckSnapshot,
            StepOutput::CopyRequest(_) => Step::CopySnapshot,
            StepOutput::CopiedSnapshot(_) => Step::CheckCopyStatus,
            StepOutput::DeleteRequest(_) => Step::DeleteTargetCluster,
            StepOutput::DeletedCluster(_) => Step::CheckDeleteStatus,
            StepOutput::RestoreRequest(_) => Step::RestoreCluster,
            StepOutput::RestoredCluster(_) => Step::CheckRestoreStatus,
            StepOutput::Users(_) => Step::ProvisionUsers,
            StepOutput::Archive(_) => Step::ArchiveSnapshot,
            StepOutput::Notification(_) => Step::Notify,
        }
    }
}

/// Returned when a step output would overwrite an existing slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("output for step {0} is already recorded")]
pub struct OutputConflict(pub Step);

/// Accumulated outputs of all completed steps. Slots are write-once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_request: Option<AsyncOperationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_snapshot: Option<CopiedSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_request: Option<AsyncOperationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_cluster: Option<DeletedCluster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_request: Option<AsyncOperationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_cluster: Option<RestoredCluster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<ProvisionedUsers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationReceipt>,
}

fn fill<T>(slot: &mut Option<T>, value: T, step: Step) -> Result<(), OutputConflict> {
    if slot.is_some() {
        return Err(OutputConflict(step));
    }
    *slot = Some(value);
    Ok(())
}

impl StepOutputs {
    /// Record a step output. Fails if the step's slot is already filled.
    pub fn merge(&mut self, output: StepOutput) -> Result<(), OutputConflict> {
        let step = output.step();
        match output {
            StepOutput::Snapshot(v) => fill(&mut self.snapshot, v, step),
            StepOutput::CopyRequest(v) => fill(&mut self.copy_request, v, step),
            StepOutput::CopiedSnapshot(v) => fill(&mut self.copied_snapshot, v, step),
            StepOutput::DeleteRequest(v) => fill(&mut self.delete_request, v, step),
            StepOutput::DeletedCluster(v) => fill(&mut self.deleted_cluster, v, step),
            StepOutput::RestoreRequest(v) => fill(&mut self.restore_request, v, step),
            StepOutput::RestoredCluster(v) => fill(&mut self.restored_cluster, v, step),
            StepOutput::Users(v) => fill(&mut self.users, v, step),
            StepOutput::Archive(v) => fill(&mut self.archive, v, step),
            StepOutput::Notification(v) => fill(&mut self.notification, v, step),
        }
    }

    /// Whether the given step has already recorded its output.
    pub fn has(&self, step: Step) -> bool {
        match step {
            Step::CheckSnapshot => self.snapshot.is_some(),
            Step::CopySnapshot => self.copy_request.is_some(),
            Step::CheckCopyStatus => self.copied_snapshot.is_some(),
            Step::DeleteTargetCluster => self.delete_request.is_some(),
            Step::CheckDeleteStatus => self.deleted_cluster.is_some(),
            Step::RestoreCluster => self.restore_request.is_some(),
            Step::CheckRestoreStatus => self.restored_cluster.is_some(),
            Step::ProvisionUsers => self.users.is_some(),
            Step::ArchiveSnapshot => self.archive.is_some(),
            Step::Notify => self.notification.is_some(),
            Step::Done => false,
        }
    }

    /// Flatten outputs into dotted keys for layered configuration lookups.
    pub fn as_settings(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        if let Some(ref s) = self.snapshot {
            settings.insert("snapshot.id".to_string(), s.snapshot_id.clone());
            settings.insert("snapshot.arn".to_string(), s.arn.clone());
            if let Some(ref engine) = s.engine {
                settings.insert("snapshot.engine".to_string(), engine.clone());
            }
        }
        if let Some(ref c) = self.copied_snapshot {
            settings.insert("copied_snapshot.id".to_string(), c.snapshot_id.clone());
            settings.insert("copied_snapshot.arn".to_string(), c.arn.clone());
        }
        if let Some(ref r) = self.restored_cluster {
            settings.insert("cluster.endpoint".to_string(), r.endpoint.clone());
            settings.insert("cluster.port".to_string(), r.port.to_string());
        }
        settings
    }
}

// ============================================================================
// Operation
// ============================================================================

/// A single restore operation and all of its persisted progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub requested_by: String,
    pub parameters: RestoreParameters,
    pub current_step: Step,
    pub status: OperationStatus,
    pub outputs: StepOutputs,
    /// Retries of the current step. Reset when the step changes.
    pub retry_count: u32,
    /// Polls of the current asynchronous operation. Reset when the step changes.
    pub poll_attempt: u32,
    pub last_error: Option<StepError>,
    pub step_started_at: DateTime<Utc>,
    /// Earliest time the operation should be driven again.
    pub next_run_at: Option<DateTime<Utc>>,
    pub cancel_requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by every successful write.
    pub version: u64,
}

impl Operation {
    /// Whether the operation is ready to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_run_at.is_none_or(|at| at <= now)
    }
}
