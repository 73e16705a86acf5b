//! Testing utilities and mock implementations.
//!
//! Mocks for every collaborator trait, so the orchestrator can be exercised
//! end to end without a control plane, secret store or database.
//!
//! # Example
//!
//! ```rust,ignore
//! use clusterback_core::testing::{fixtures, MockResourceControl};
//!
//! let resources = MockResourceControl::new();
//! resources.add_snapshot(fixtures::SNAPSHOT_ID, "available").await;
//! resources.push_copy_status("copying").await;
//! ```

mod mock_notifier;
mod mock_provisioner;
mod mock_resources;
mod mock_secrets;

pub use mock_notifier::{MockNotificationSink, PublishedNotification};
pub use mock_provisioner::{MockProvisioner, RecordedProvision};
pub use mock_resources::{MockResourceControl, RecordedStart};
pub use mock_secrets::MockSecretStore;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::collections::{BTreeMap, HashMap};

    use chrono::Utc;

    use crate::engine::{OrchestratorConfig, PollConfig, RetryConfig, StepBudgets, UserGrant};
    use crate::operation::{
        ArchiveResult, AsyncOperationRef, CopiedSnapshot, CreateOperationRequest, EngineOptions,
        Location, NetworkPlacement, NotificationReceipt, Operation, OperationStatus,
        ProvisionedUsers, RestoreParameters, RestoredCluster, SnapshotDescriptor,
        SnapshotSelector, Step, StepOutput, StepOutputs,
    };

    /// Snapshot id the default parameters select.
    pub const SNAPSHOT_ID: &str = "snap-orders-2024-03-20";

    pub const SOURCE_CLUSTER: &str = "orders";

    pub fn source_location() -> Location {
        Location::new("111111111111", "us-east-1")
    }

    pub fn target_location() -> Location {
        Location::new("222222222222", "eu-west-1")
    }

    /// Cross-account restore of [`SNAPSHOT_ID`] into `target_cluster_id`.
    pub fn restore_parameters(target_cluster_id: &str) -> RestoreParameters {
        RestoreParameters {
            snapshot: SnapshotSelector::Identifier {
                id: SNAPSHOT_ID.to_string(),
            },
            source_cluster_id: SOURCE_CLUSTER.to_string(),
            source: source_location(),
            target: target_location(),
            target_cluster_id: target_cluster_id.to_string(),
            network: NetworkPlacement {
                subnet_group: "restore-subnets".to_string(),
                security_group_ids: vec!["sg-0123".to_string()],
                availability_zone: None,
                publicly_accessible: false,
            },
            engine: EngineOptions {
                engine: "aurora-postgresql".to_string(),
                engine_version: Some("15.4".to_string()),
                instance_class: Some("db.r6g.large".to_string()),
                port: Some(5432),
                parameter_group: None,
                deletion_protection: false,
            },
            options: BTreeMap::new(),
        }
    }

    pub fn create_request(target_cluster_id: &str) -> CreateOperationRequest {
        CreateOperationRequest {
            operation_id: None,
            requested_by: "alice".to_string(),
            parameters: restore_parameters(target_cluster_id),
        }
    }

    /// Unsaved pending operation at the first step.
    pub fn operation(target_cluster_id: &str) -> Operation {
        let now = Utc::now();
        Operation {
            id: "op-test".to_string(),
            requested_by: "alice".to_string(),
            parameters: restore_parameters(target_cluster_id),
            current_step: Step::CheckSnapshot,
            status: OperationStatus::Pending,
            outputs: StepOutputs::default(),
            retry_count: 0,
            poll_attempt: 0,
            last_error: None,
            step_started_at: now,
            next_run_at: None,
            cancel_requested_by: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// In-progress operation sitting at `step`, with no outputs.
    pub fn operation_at(step: Step) -> Operation {
        let mut op = operation("orders-restored");
        op.current_step = step;
        op.status = OperationStatus::InProgress;
        op
    }

    /// Output a step produces on the path without a pre-existing target.
    pub fn sample_output(step: Step) -> Option<StepOutput> {
        let started = |prefix: &str, resource: &str| AsyncOperationRef {
            operation_ref: format!("{}-1", prefix),
            resource_id: resource.to_string(),
            idempotency_token: format!("token-{}", prefix),
            started_at: Utc::now(),
        };
        let copy_id = format!("{}-restore-copy", SNAPSHOT_ID);

        let output = match step {
            Step::CheckSnapshot => StepOutput::Snapshot(SnapshotDescriptor {
                snapshot_id: SNAPSHOT_ID.to_string(),
                arn: format!("arn:mock:snapshot:{}", SNAPSHOT_ID),
                status: "available".to_string(),
                engine: Some("aurora-postgresql".to_string()),
                created_at: None,
            }),
            Step::CopySnapshot => StepOutput::CopyRequest(started("copy", &copy_id)),
            Step::CheckCopyStatus => StepOutput::CopiedSnapshot(CopiedSnapshot {
                arn: format!("arn:mock:snapshot:{}", copy_id),
                snapshot_id: copy_id,
                target_exists: false,
            }),
            Step::RestoreCluster => {
                StepOutput::RestoreRequest(started("restore", "orders-restored"))
            }
            Step::CheckRestoreStatus => StepOutput::RestoredCluster(RestoredCluster {
                cluster_id: "orders-restored".to_string(),
                arn: None,
                endpoint: "orders-restored.cluster.mock".to_string(),
                port: 5432,
            }),
            Step::ProvisionUsers => StepOutput::Users(ProvisionedUsers {
                usernames: vec!["app".to_string()],
            }),
            Step::ArchiveSnapshot => StepOutput::Archive(ArchiveResult {
                snapshot_id: format!("{}-restore-copy", SNAPSHOT_ID),
                archived: true,
            }),
            Step::Notify => StepOutput::Notification(NotificationReceipt {
                topic: "cluster-restore".to_string(),
                delivered: true,
                published_at: Utc::now(),
            }),
            Step::DeleteTargetCluster | Step::CheckDeleteStatus | Step::Done => return None,
        };
        Some(output)
    }

    /// Outputs of every step up to and including `last`, skipping deletion.
    pub fn outputs_through(last: Step) -> StepOutputs {
        let mut outputs = StepOutputs::default();
        for step in Step::ALL {
            if step.ordinal() > last.ordinal() {
                break;
            }
            if let Some(output) = sample_output(step) {
                outputs
                    .merge(output)
                    .expect("sample outputs fill distinct slots");
            }
        }
        outputs
    }

    /// Orchestrator settings with millisecond intervals.
    pub fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            enabled: true,
            scheduler_interval_ms: 10,
            max_concurrent_operations: 4,
            lease_ttl_secs: 30,
            poll: PollConfig {
                base_interval_ms: 5,
                max_interval_ms: 20,
                max_poll_attempts: 20,
            },
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                per_step: BTreeMap::new(),
            },
            step_budgets: StepBudgets {
                default_secs: 300,
                per_step: BTreeMap::new(),
            },
            provisioning: crate::engine::ProvisioningConfig {
                master_secret_id: "master".to_string(),
                database: "postgres".to_string(),
                users: vec![UserGrant {
                    secret_id: "app".to_string(),
                    privileges: vec!["readwrite".to_string()],
                }],
            },
            ..OrchestratorConfig::default()
        }
    }

    /// Secret payloads matching [`fast_config`]'s provisioning section.
    pub fn default_secrets() -> HashMap<String, (String, String)> {
        HashMap::from([
            (
                "master".to_string(),
                ("postgres".to_string(), "master-password".to_string()),
            ),
            (
                "app".to_string(),
                ("app".to_string(), "app-password".to_string()),
            ),
        ])
    }
}
