//! Mock resource control service for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::operation::Location;
use crate::resource::{
    ClusterInfo, CopySnapshotRequest, DeleteClusterRequest, OperationHandle, RemoteStatus,
    ResourceControl, ResourceError, RestoreClusterRequest, SnapshotInfo,
};

/// A recorded start call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedStart {
    /// "copy", "delete" or "restore".
    pub kind: &'static str,
    pub resource_id: String,
    pub idempotency_token: String,
    /// Whether this call started a new operation (false for a token replay).
    pub started: bool,
}

#[derive(Debug, Default)]
struct State {
    snapshots: HashMap<String, SnapshotInfo>,
    clusters: HashMap<String, ClusterInfo>,
    /// Handles by `(kind, idempotency token)`.
    operations: HashMap<(&'static str, String), OperationHandle>,
    starts: Vec<RecordedStart>,
    copy_statuses: VecDeque<RemoteStatus>,
    delete_statuses: VecDeque<RemoteStatus>,
    restore_statuses: VecDeque<RemoteStatus>,
    polls: HashMap<&'static str, usize>,
    /// One-shot errors keyed by call name.
    next_errors: HashMap<&'static str, ResourceError>,
    deleted_snapshots: HashSet<String>,
}

/// Mock implementation of the `ResourceControl` trait.
///
/// Provides controllable behavior for testing:
/// - Register snapshots and clusters
/// - Queue provider statuses per asynchronous operation kind
/// - Inject a one-shot error for any call
/// - Track start calls and idempotency token replays
///
/// Polls with an empty status queue report completion, so a bare mock walks
/// an operation straight through.
///
/// # Example
///
/// ```rust,ignore
/// use clusterback_core::testing::MockResourceControl;
///
/// let resources = MockResourceControl::new();
/// resources.add_snapshot("snap-2024-03-20", "available").await;
/// resources.push_copy_status("copying").await;
///
/// // First poll reports "copying", the next one "available".
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockResourceControl {
    state: Arc<RwLock<State>>,
}

impl MockResourceControl {
    /// Create a new mock with no snapshots or clusters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot with the given provider status.
    pub async fn add_snapshot(&self, snapshot_id: &str, status: &str) {
        self.state.write().await.snapshots.insert(
            snapshot_id.to_string(),
            SnapshotInfo {
                snapshot_id: snapshot_id.to_string(),
                arn: format!("arn:mock:snapshot:{}", snapshot_id),
                status: status.to_string(),
                engine: Some("aurora-postgresql".to_string()),
                created_at: None,
            },
        );
    }

    /// Register an existing, available cluster.
    pub async fn add_cluster(&self, cluster_id: &str) {
        self.state.write().await.clusters.insert(
            cluster_id.to_string(),
            ClusterInfo {
                cluster_id: cluster_id.to_string(),
                status: "available".to_string(),
                endpoint: Some(format!("{}.cluster.mock", cluster_id)),
                port: Some(5432),
            },
        );
    }

    pub async fn has_cluster(&self, cluster_id: &str) -> bool {
        self.state.read().await.clusters.contains_key(cluster_id)
    }

    /// Queue a status for the next copy poll.
    pub async fn push_copy_status(&self, status: &str) {
        self.push_copy(RemoteStatus::new(status)).await;
    }

    pub async fn push_copy(&self, status: RemoteStatus) {
        self.state.write().await.copy_statuses.push_back(status);
    }

    /// Queue a status for the next delete poll.
    pub async fn push_delete_status(&self, status: &str) {
        self.state
            .write()
            .await
            .delete_statuses
            .push_back(RemoteStatus::new(status));
    }

    /// Queue a status for the next restore poll.
    pub async fn push_restore_status(&self, status: &str) {
        self.push_restore(RemoteStatus::new(status)).await;
    }

    pub async fn push_restore(&self, status: RemoteStatus) {
        self.state.write().await.restore_statuses.push_back(status);
    }

    /// Make the next call named `call` fail with `error`.
    ///
    /// Call names are the trait method names, e.g. `"start_copy"`.
    pub async fn fail_next(&self, call: &'static str, error: ResourceError) {
        self.state.write().await.next_errors.insert(call, error);
    }

    pub async fn fail_next_delete_snapshot(&self, error: ResourceError) {
        self.fail_next("delete_snapshot", error).await;
    }

    /// Number of start calls of `kind` ("copy", "delete", "restore").
    pub async fn start_requests(&self, kind: &str) -> usize {
        self.state
            .read()
            .await
            .starts
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Number of distinct operations of `kind` actually started.
    pub async fn started_operations(&self, kind: &str) -> usize {
        self.state
            .read()
            .await
            .starts
            .iter()
            .filter(|s| s.kind == kind && s.started)
            .count()
    }

    /// Get all recorded start calls.
    pub async fn recorded_starts(&self) -> Vec<RecordedStart> {
        self.state.read().await.starts.clone()
    }

    /// Number of polls of `kind` ("copy", "delete", "restore").
    pub async fn poll_count(&self, kind: &str) -> usize {
        self.state.read().await.polls.get(kind).copied().unwrap_or(0)
    }

    pub async fn snapshot_deleted(&self, snapshot_id: &str) -> bool {
        self.state
            .read()
            .await
            .deleted_snapshots
            .contains(snapshot_id)
    }

    async fn take_error(&self, call: &'static str) -> Result<(), ResourceError> {
        match self.state.write().await.next_errors.remove(call) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn start(
        &self,
        kind: &'static str,
        resource_id: &str,
        token: &str,
    ) -> OperationHandle {
        let mut state = self.state.write().await;
        let key = (kind, token.to_string());
        let (handle, started) = match state.operations.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                let handle = OperationHandle {
                    operation_ref: format!("{}-{}", kind, state.operations.len() + 1),
                    resource_id: resource_id.to_string(),
                };
                state.operations.insert(key, handle.clone());
                (handle, true)
            }
        };
        state.starts.push(RecordedStart {
            kind,
            resource_id: resource_id.to_string(),
            idempotency_token: token.to_string(),
            started,
        });
        handle
    }

    async fn next_status(&self, kind: &'static str, done: RemoteStatus) -> RemoteStatus {
        let mut state = self.state.write().await;
        *state.polls.entry(kind).or_insert(0) += 1;
        let queued = match kind {
            "copy" => state.copy_statuses.pop_front(),
            "delete" => state.delete_statuses.pop_front(),
            _ => state.restore_statuses.pop_front(),
        };
        queued.unwrap_or(done)
    }
}

#[async_trait]
impl ResourceControl for MockResourceControl {
    fn name(&self) -> &str {
        "mock"
    }

    async fn describe_snapshot(
        &self,
        snapshot_id: &str,
        _location: &Location,
    ) -> Result<SnapshotInfo, ResourceError> {
        self.take_error("describe_snapshot").await?;
        self.state
            .read()
            .await
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(snapshot_id.to_string()))
    }

    async fn start_copy(
        &self,
        request: &CopySnapshotRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.take_error("start_copy").await?;
        Ok(self
            .start("copy", &request.target_snapshot_id, &request.idempotency_token)
            .await)
    }

    async fn poll_copy(&self, _operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        self.take_error("poll_copy").await?;
        Ok(self.next_status("copy", RemoteStatus::new("available")).await)
    }

    async fn describe_cluster(
        &self,
        cluster_id: &str,
        _location: &Location,
    ) -> Result<Option<ClusterInfo>, ResourceError> {
        self.take_error("describe_cluster").await?;
        Ok(self.state.read().await.clusters.get(cluster_id).cloned())
    }

    async fn start_delete(
        &self,
        request: &DeleteClusterRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.take_error("start_delete").await?;
        Ok(self
            .start("delete", &request.cluster_id, &request.idempotency_token)
            .await)
    }

    async fn poll_delete(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        self.take_error("poll_delete").await?;
        let status = self.next_status("delete", RemoteStatus::new("deleted")).await;

        if status.status == "deleted" {
            let mut state = self.state.write().await;
            let cluster_id = state
                .operations
                .values()
                .find(|h| h.operation_ref == operation_ref)
                .map(|h| h.resource_id.clone());
            if let Some(cluster_id) = cluster_id {
                state.clusters.remove(&cluster_id);
            }
        }
        Ok(status)
    }

    async fn start_restore(
        &self,
        request: &RestoreClusterRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.take_error("start_restore").await?;
        Ok(self
            .start("restore", &request.cluster_id, &request.idempotency_token)
            .await)
    }

    async fn poll_restore(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        self.take_error("poll_restore").await?;
        let cluster_id = self
            .state
            .read()
            .await
            .operations
            .values()
            .find(|h| h.operation_ref == operation_ref)
            .map(|h| h.resource_id.clone())
            .unwrap_or_else(|| "orders-restored".to_string());

        let done = RemoteStatus {
            status: "available".to_string(),
            resource_arn: Some(format!("arn:mock:cluster:{}", cluster_id)),
            endpoint: Some(format!("{}.cluster.mock", cluster_id)),
            port: Some(5432),
            detail: None,
        };
        let status = self.next_status("restore", done).await;
        if status.status == "available" {
            self.add_cluster(&cluster_id).await;
        }
        Ok(status)
    }

    async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        _location: &Location,
    ) -> Result<(), ResourceError> {
        self.take_error("delete_snapshot").await?;
        self.state
            .write()
            .await
            .deleted_snapshots
            .insert(snapshot_id.to_string());
        Ok(())
    }
}
