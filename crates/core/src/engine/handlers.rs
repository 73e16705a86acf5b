//! Step handlers.
//!
//! One method per step. Handlers read the persisted operation, call exactly
//! the collaborators their step needs and return a [`StepOutcome`]. They never
//! write state themselves and never return `Err`: every collaborator error is
//! classified into a [`StepFailure`].

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LayeredConfig;
use crate::notify::{Notification, NotificationSink, NotifyError};
use crate::operation::{
    ArchiveResult, AsyncOperationRef, CopiedSnapshot, DeletedCluster, NotificationReceipt,
    Operation, OperationStatus, ProvisionedUsers, RestoreParameters, RestoredCluster,
    SnapshotDescriptor, SnapshotSelector, Step, StepOutput,
};
use crate::provision::{ProvisionRequest, UserAccess, UserProvisioner};
use crate::resource::{
    CopySnapshotRequest, DeleteClusterRequest, OperationHandle, RemoteStatus, ResourceControl,
    ResourceError, RestoreClusterRequest,
};
use crate::secrets::SecretStore;

use super::config::{ArchiveFailurePolicy, OrchestratorConfig};
use super::poller::{PollDecision, ResourceKind, StatusPoller};
use super::types::{StepFailure, StepOutcome};

/// Settings keys consulted through the layered lookup.
pub mod keys {
    pub const SNAPSHOT_NAME_TEMPLATE: &str = "snapshot_name_template";
    pub const SKIP_FINAL_SNAPSHOT: &str = "skip_final_snapshot";
    pub const MASTER_SECRET_ID: &str = "master_secret_id";
    pub const DATABASE: &str = "database";
    pub const ARCHIVE_FAILURE_POLICY: &str = "archive_failure_policy";
    pub const NOTIFICATION_TOPIC: &str = "notification_topic";
}

/// External services the handlers call.
#[derive(Clone)]
pub struct Collaborators {
    pub resources: Arc<dyn ResourceControl>,
    pub secrets: Arc<dyn SecretStore>,
    pub provisioner: Arc<dyn UserProvisioner>,
    pub notifier: Arc<dyn NotificationSink>,
}

/// Everything a handler may read for one invocation.
pub struct StepContext<'a> {
    pub operation: &'a Operation,
    pub settings: &'a LayeredConfig,
}

/// Idempotency token of a step's start call: the first 32 hex characters of
/// `sha256("<operation_id>:<step>")`.
pub fn idempotency_token(operation_id: &str, step: Step) -> String {
    let digest = Sha256::digest(format!("{}:{}", operation_id, step.as_str()).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

/// Snapshot identifier for the operation's selector.
///
/// Date selectors expand `{date}` (YYYY-MM-DD) and `{cluster}` in `template`.
pub fn resolve_snapshot_id(parameters: &RestoreParameters, template: &str) -> String {
    match parameters.snapshot {
        SnapshotSelector::Identifier { ref id } => id.clone(),
        SnapshotSelector::Date { date } => template
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
            .replace("{cluster}", &parameters.source_cluster_id),
    }
}

/// One-line description of a step output for audit records.
pub fn summarize(output: &StepOutput) -> String {
    match output {
        StepOutput::Snapshot(s) => format!("snapshot {} is {}", s.snapshot_id, s.status),
        StepOutput::CopyRequest(r) => format!("copy {} started as {}", r.resource_id, r.operation_ref),
        StepOutput::CopiedSnapshot(c) => format!(
            "copy {} available, target cluster {}",
            c.snapshot_id,
            if c.target_exists { "exists" } else { "absent" }
        ),
        StepOutput::DeleteRequest(r) => format!("deletion of {} started", r.resource_id),
        StepOutput::DeletedCluster(d) => format!("cluster {} deleted", d.cluster_id),
        StepOutput::RestoreRequest(r) => format!("restore of {} started", r.resource_id),
        StepOutput::RestoredCluster(r) => {
            format!("cluster {} available at {}:{}", r.cluster_id, r.endpoint, r.port)
        }
        StepOutput::Users(u) => format!("{} users provisioned", u.usernames.len()),
        StepOutput::Archive(a) if a.archived => format!("snapshot {} deleted", a.snapshot_id),
        StepOutput::Archive(a) => format!("snapshot {} kept", a.snapshot_id),
        StepOutput::Notification(n) => format!("notification sent to {}", n.topic),
    }
}

fn missing(what: &str) -> StepOutcome {
    StepOutcome::Fail(StepFailure::internal(format!(
        "{} missing from operation outputs",
        what
    )))
}

fn async_ref(handle: OperationHandle, token: String) -> AsyncOperationRef {
    AsyncOperationRef {
        operation_ref: handle.operation_ref,
        resource_id: handle.resource_id,
        idempotency_token: token,
        started_at: Utc::now(),
    }
}

/// The step handler set.
pub struct StepHandlers {
    collaborators: Collaborators,
    config: Arc<OrchestratorConfig>,
    poller: StatusPoller,
}

impl StepHandlers {
    pub fn new(collaborators: Collaborators, config: Arc<OrchestratorConfig>) -> Self {
        let poller = StatusPoller::new(&config.poll);
        Self {
            collaborators,
            config,
            poller,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.collaborators.notifier
    }

    /// Notification topic for an operation.
    pub fn topic(&self, settings: &LayeredConfig) -> String {
        settings.get(keys::NOTIFICATION_TOPIC, &self.config.notification_topic)
    }

    /// Run the handler of the operation's current step.
    pub async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let step = ctx.operation.current_step;
        debug!(operation_id = %ctx.operation.id, step = %step, "Running step handler");

        match step {
            Step::CheckSnapshot => self.check_snapshot(ctx).await,
            Step::CopySnapshot => self.copy_snapshot(ctx).await,
            Step::CheckCopyStatus => self.check_copy_status(ctx).await,
            Step::DeleteTargetCluster => self.delete_target_cluster(ctx).await,
            Step::CheckDeleteStatus => self.check_delete_status(ctx).await,
            Step::RestoreCluster => self.restore_cluster(ctx).await,
            Step::CheckRestoreStatus => self.check_restore_status(ctx).await,
            Step::ProvisionUsers => self.provision_users(ctx).await,
            Step::ArchiveSnapshot => self.archive_snapshot(ctx).await,
            Step::Notify => self.notify(ctx).await,
            Step::Done => StepOutcome::Fail(StepFailure::internal("DONE has no handler")),
        }
    }

    async fn check_snapshot(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let params = &ctx.operation.parameters;
        let template = ctx.settings.get(
            keys::SNAPSHOT_NAME_TEMPLATE,
            &self.config.snapshot_name_template,
        );
        let snapshot_id = resolve_snapshot_id(params, &template);

        match self
            .collaborators
            .resources
            .describe_snapshot(&snapshot_id, &params.source)
            .await
        {
            Ok(info) if info.status.eq_ignore_ascii_case("available") => {
                StepOutcome::Advance(StepOutput::Snapshot(SnapshotDescriptor {
                    snapshot_id: info.snapshot_id,
                    arn: info.arn,
                    status: info.status,
                    engine: info.engine,
                    created_at: info.created_at,
                }))
            }
            Ok(info) => StepOutcome::Fail(StepFailure::transient(format!(
                "snapshot {} is {}, not available",
                info.snapshot_id, info.status
            ))),
            Err(ResourceError::NotFound(_)) => StepOutcome::Fail(StepFailure::not_found(format!(
                "snapshot {} not found in {}",
                snapshot_id, params.source
            ))),
            Err(e) => StepOutcome::Fail(e.into()),
        }
    }

    async fn copy_snapshot(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(snapshot) = op.outputs.snapshot.as_ref() else {
            return missing("snapshot");
        };
        let token = idempotency_token(&op.id, Step::CopySnapshot);
        let request = CopySnapshotRequest {
            source_arn: snapshot.arn.clone(),
            source: op.parameters.source.clone(),
            target: op.parameters.target.clone(),
            target_snapshot_id: format!("{}-restore-{}", snapshot.snapshot_id, &token[..8]),
            idempotency_token: token.clone(),
        };

        match self.collaborators.resources.start_copy(&request).await {
            Ok(handle) => StepOutcome::Advance(StepOutput::CopyRequest(async_ref(handle, token))),
            Err(e) => StepOutcome::Fail(e.into()),
        }
    }

    async fn check_copy_status(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(copy) = op.outputs.copy_request.as_ref() else {
            return missing("copy request");
        };
        let resources = &self.collaborators.resources;

        let status = match resources.poll_copy(&copy.operation_ref).await {
            Ok(status) => status,
            Err(e) => return StepOutcome::Fail(e.into()),
        };

        let status = match self.poll(ResourceKind::SnapshotCopy, op, status) {
            Ok(status) => status,
            Err(outcome) => return outcome,
        };

        // Decides the conditional edge out of this step.
        let target = &op.parameters;
        let target_exists = match resources
            .describe_cluster(&target.target_cluster_id, &target.target)
            .await
        {
            Ok(cluster) => cluster.is_some(),
            Err(e) => return StepOutcome::Fail(e.into()),
        };

        StepOutcome::Advance(StepOutput::CopiedSnapshot(CopiedSnapshot {
            snapshot_id: copy.resource_id.clone(),
            arn: status.resource_arn.unwrap_or_else(|| copy.resource_id.clone()),
            target_exists,
        }))
    }

    async fn delete_target_cluster(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let token = idempotency_token(&op.id, Step::DeleteTargetCluster);
        let request = DeleteClusterRequest {
            cluster_id: op.parameters.target_cluster_id.clone(),
            location: op.parameters.target.clone(),
            skip_final_snapshot: ctx.settings.get(keys::SKIP_FINAL_SNAPSHOT, "true") == "true",
            idempotency_token: token.clone(),
        };

        match self.collaborators.resources.start_delete(&request).await {
            Ok(handle) => StepOutcome::Advance(StepOutput::DeleteRequest(async_ref(handle, token))),
            Err(e) => StepOutcome::Fail(e.into()),
        }
    }

    async fn check_delete_status(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(delete) = op.outputs.delete_request.as_ref() else {
            return missing("delete request");
        };
        let done = || {
            StepOutcome::Advance(StepOutput::DeletedCluster(DeletedCluster {
                cluster_id: op.parameters.target_cluster_id.clone(),
            }))
        };

        let status = match self.collaborators.resources.poll_delete(&delete.operation_ref).await {
            Ok(status) => status,
            // A deletion whose cluster is gone is finished.
            Err(ResourceError::NotFound(_)) => return done(),
            Err(e) => return StepOutcome::Fail(e.into()),
        };

        match self.poll(ResourceKind::ClusterDeletion, op, status) {
            Ok(_) => done(),
            Err(outcome) => outcome,
        }
    }

    async fn restore_cluster(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(copied) = op.outputs.copied_snapshot.as_ref() else {
            return missing("copied snapshot");
        };
        let token = idempotency_token(&op.id, Step::RestoreCluster);
        let request = RestoreClusterRequest {
            cluster_id: op.parameters.target_cluster_id.clone(),
            snapshot_arn: copied.arn.clone(),
            location: op.parameters.target.clone(),
            network: op.parameters.network.clone(),
            engine: op.parameters.engine.clone(),
            idempotency_token: token.clone(),
        };

        match self.collaborators.resources.start_restore(&request).await {
            Ok(handle) => {
                StepOutcome::Advance(StepOutput::RestoreRequest(async_ref(handle, token)))
            }
            Err(e) => StepOutcome::Fail(e.into()),
        }
    }

    async fn check_restore_status(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(restore) = op.outputs.restore_request.as_ref() else {
            return missing("restore request");
        };
        let resources = &self.collaborators.resources;
        let params = &op.parameters;

        let status = match resources.poll_restore(&restore.operation_ref).await {
            Ok(status) => status,
            Err(e) => return StepOutcome::Fail(e.into()),
        };
        let status = match self.poll(ResourceKind::ClusterRestore, op, status) {
            Ok(status) => status,
            Err(outcome) => return outcome,
        };

        let (endpoint, port) = match (status.endpoint.clone(), status.port) {
            (Some(endpoint), port) => (endpoint, port),
            (None, _) => match resources
                .describe_cluster(&params.target_cluster_id, &params.target)
                .await
            {
                Ok(Some(cluster)) => match cluster.endpoint {
                    Some(endpoint) => (endpoint, cluster.port),
                    None => {
                        return StepOutcome::Fail(StepFailure::provider_failure(format!(
                            "restored cluster {} has no endpoint",
                            params.target_cluster_id
                        )))
                    }
                },
                Ok(None) => {
                    return StepOutcome::Fail(StepFailure::provider_failure(format!(
                        "restored cluster {} disappeared",
                        params.target_cluster_id
                    )))
                }
                Err(e) => return StepOutcome::Fail(e.into()),
            },
        };

        StepOutcome::Advance(StepOutput::RestoredCluster(RestoredCluster {
            cluster_id: params.target_cluster_id.clone(),
            arn: status.resource_arn,
            endpoint,
            port: port.or(params.engine.port).unwrap_or(5432),
        }))
    }

    async fn provision_users(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(cluster) = op.outputs.restored_cluster.as_ref() else {
            return missing("restored cluster");
        };
        let secrets = &self.collaborators.secrets;
        let provisioning = &self.config.provisioning;

        let master_id = ctx
            .settings
            .get(keys::MASTER_SECRET_ID, &provisioning.master_secret_id);
        let master = match secrets.get_secret(&master_id).await {
            Ok(creds) => creds,
            Err(e) => return StepOutcome::Fail(e.into()),
        };

        let mut users = Vec::with_capacity(provisioning.users.len());
        for grant in &provisioning.users {
            match secrets.get_secret(&grant.secret_id).await {
                Ok(credentials) => users.push(UserAccess {
                    credentials,
                    privileges: grant.privileges.clone(),
                }),
                Err(e) => return StepOutcome::Fail(e.into()),
            }
        }

        let request = ProvisionRequest {
            cluster_id: cluster.cluster_id.clone(),
            endpoint: cluster.endpoint.clone(),
            port: cluster.port,
            database: ctx.settings.get(keys::DATABASE, &provisioning.database),
            master,
            users,
        };

        match self.collaborators.provisioner.provision(&request).await {
            Ok(report) => StepOutcome::Advance(StepOutput::Users(ProvisionedUsers {
                usernames: report.usernames,
            })),
            Err(e) => StepOutcome::Fail(e.into()),
        }
    }

    async fn archive_snapshot(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let op = ctx.operation;
        let Some(copied) = op.outputs.copied_snapshot.as_ref() else {
            return missing("copied snapshot");
        };
        let archived = |archived| ArchiveResult {
            snapshot_id: copied.snapshot_id.clone(),
            archived,
        };

        let error = match self
            .collaborators
            .resources
            .delete_snapshot(&copied.snapshot_id, &op.parameters.target)
            .await
        {
            Ok(()) | Err(ResourceError::NotFound(_)) => {
                return StepOutcome::Advance(StepOutput::Archive(archived(true)))
            }
            Err(e) => e,
        };

        match self.archive_policy(ctx.settings) {
            ArchiveFailurePolicy::Fail => StepOutcome::Fail(error.into()),
            ArchiveFailurePolicy::Warn => {
                warn!(
                    operation_id = %op.id,
                    snapshot_id = %copied.snapshot_id,
                    error = %error,
                    "Temporary snapshot was not deleted"
                );
                StepOutcome::Degraded {
                    output: StepOutput::Archive(archived(false)),
                    warning: format!(
                        "temporary snapshot {} was not deleted: {}",
                        copied.snapshot_id, error
                    ),
                }
            }
        }
    }

    async fn notify(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let topic = self.topic(ctx.settings);
        let notification = Notification::for_operation(ctx.operation, OperationStatus::Succeeded);
        let result = self.collaborators.notifier.publish(&topic, &notification).await;

        let receipt = NotificationReceipt {
            topic,
            delivered: result.is_ok(),
            published_at: Utc::now(),
        };
        match result {
            Ok(()) => StepOutcome::Advance(StepOutput::Notification(receipt)),
            Err(e) => StepOutcome::Degraded {
                output: StepOutput::Notification(receipt),
                warning: format!("notification not delivered: {}", e),
            },
        }
    }

    /// Publish a terminal failure or cancellation summary.
    pub async fn publish_final(
        &self,
        operation: &Operation,
        status: OperationStatus,
        settings: &LayeredConfig,
    ) -> (String, Result<(), NotifyError>) {
        let topic = self.topic(settings);
        let notification = Notification::for_operation(operation, status);
        let result = self.collaborators.notifier.publish(&topic, &notification).await;
        (topic, result)
    }

    fn archive_policy(&self, settings: &LayeredConfig) -> ArchiveFailurePolicy {
        match settings.get_opt(keys::ARCHIVE_FAILURE_POLICY).as_deref() {
            Some("fail") => ArchiveFailurePolicy::Fail,
            Some("warn") => ArchiveFailurePolicy::Warn,
            _ => self.config.archive_failure_policy,
        }
    }

    /// Completed status, or the outcome to return from the handler.
    fn poll(
        &self,
        kind: ResourceKind,
        op: &Operation,
        status: RemoteStatus,
    ) -> Result<RemoteStatus, StepOutcome> {
        let observed = status.status.clone();
        match self.poller.evaluate(kind, op.poll_attempt + 1, status) {
            PollDecision::Complete(status) => Ok(status),
            PollDecision::Recheck { delay, .. } => Err(StepOutcome::Wait {
                delay,
                status: observed,
            }),
            PollDecision::Fail(failure) => Err(StepOutcome::Fail(failure)),
        }
    }
}
