//! Orchestrator lifecycle integration tests.
//!
//! These tests drive complete restore operations through the step graph
//! against file-backed stores and mock collaborators:
//! check snapshot -> copy -> (delete) -> restore -> provision -> archive -> notify

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;

use clusterback_core::{
    engine::graph,
    provision::ProvisionError,
    testing::{
        fixtures, MockNotificationSink, MockProvisioner, MockResourceControl, MockSecretStore,
    },
    AuditOutcome, AuditRecord, AuditStore, Collaborators, CreateOperationRequest, DriveOutcome,
    ErrorKind, OperationStatus, OperationStore, OrchestratorConfig, ResourceError,
    RestoreOrchestrator, SnapshotSelector, SqliteAuditStore, SqliteOperationStore, Step,
};

const TARGET: &str = "orders-restored";

/// Test helper owning the stores and every mock collaborator.
struct TestHarness {
    store: Arc<SqliteOperationStore>,
    audit: Arc<SqliteAuditStore>,
    resources: Arc<MockResourceControl>,
    secrets: Arc<MockSecretStore>,
    provisioner: Arc<MockProvisioner>,
    notifier: Arc<MockNotificationSink>,
    temp_dir: TempDir,
}

impl TestHarness {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let store =
            Arc::new(SqliteOperationStore::new(&db_path).expect("Failed to create operation store"));
        let audit = Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to create audit store"));

        let resources = Arc::new(MockResourceControl::new());
        resources.add_snapshot(fixtures::SNAPSHOT_ID, "available").await;

        Self {
            store,
            audit,
            resources,
            secrets: Arc::new(MockSecretStore::with_defaults()),
            provisioner: Arc::new(MockProvisioner::new()),
            notifier: Arc::new(MockNotificationSink::new()),
            temp_dir,
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            resources: self.resources.clone(),
            secrets: self.secrets.clone(),
            provisioner: self.provisioner.clone(),
            notifier: self.notifier.clone(),
        }
    }

    fn orchestrator_with(&self, config: OrchestratorConfig, executor: &str) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            config,
            Arc::clone(&self.store) as Arc<dyn OperationStore>,
            Arc::clone(&self.audit) as Arc<dyn AuditStore>,
            self.collaborators(),
        )
        .with_executor_id(executor)
        .with_env_prefix("CLUSTERBACK_LIFECYCLE_TEST_")
    }

    fn orchestrator(&self) -> RestoreOrchestrator {
        self.orchestrator_with(fixtures::fast_config(), "executor-a")
    }

    /// A second process restarted on the same database files.
    fn restarted_orchestrator(&self, executor: &str) -> RestoreOrchestrator {
        let db_path = self.temp_dir.path().join("test.db");
        RestoreOrchestrator::new(
            fixtures::fast_config(),
            Arc::new(SqliteOperationStore::new(&db_path).expect("Failed to reopen store")),
            Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to reopen audit")),
            self.collaborators(),
        )
        .with_executor_id(executor)
        .with_env_prefix("CLUSTERBACK_LIFECYCLE_TEST_")
    }

    fn submit(&self, orchestrator: &RestoreOrchestrator) -> String {
        orchestrator
            .submit(fixtures::create_request(TARGET))
            .expect("Failed to submit operation")
            .id
    }

    fn trail(&self, operation_id: &str) -> Vec<AuditRecord> {
        self.audit
            .events_for(operation_id)
            .expect("Failed to read audit trail")
    }

    fn events(&self, operation_id: &str, event_type: &str) -> Vec<AuditRecord> {
        self.trail(operation_id)
            .into_iter()
            .filter(|r| r.event_type == event_type)
            .collect()
    }

    /// Steps named by step transition entries, in audit order.
    fn step_path(&self, operation_id: &str) -> Vec<Step> {
        self.trail(operation_id)
            .into_iter()
            .filter(|r| r.event_type.starts_with("step_"))
            .filter_map(|r| r.step)
            .collect()
    }
}

#[tokio::test]
async fn test_restore_without_existing_target_succeeds() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);

    let op = orchestrator.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.current_step, Step::Done);
    assert!(op.last_error.is_none());

    let restored = op.outputs.restored_cluster.as_ref().unwrap();
    assert_eq!(restored.endpoint, "orders-restored.cluster.mock");
    assert_eq!(op.outputs.users.as_ref().unwrap().usernames, vec!["app"]);
    assert!(op.outputs.archive.as_ref().unwrap().archived);

    // The conditional edge skipped both deletion steps.
    let path = harness.step_path(&id);
    assert!(!path.contains(&Step::DeleteTargetCluster));
    assert!(!path.contains(&Step::CheckDeleteStatus));
    assert!(graph::is_valid_path(&path));
    assert_eq!(harness.resources.start_requests("delete").await, 0);

    let copied = op.outputs.copied_snapshot.as_ref().unwrap();
    assert!(harness.resources.snapshot_deleted(&copied.snapshot_id).await);
}

#[tokio::test]
async fn test_existing_target_is_deleted_before_restore() {
    let harness = TestHarness::new().await;
    harness.resources.add_cluster(TARGET).await;
    harness.resources.push_delete_status("deleting").await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);

    let path = harness.step_path(&id);
    assert!(graph::is_valid_path(&path));
    let delete_at = path
        .iter()
        .position(|s| *s == Step::CheckDeleteStatus)
        .expect("deletion was polled");
    let restore_at = path
        .iter()
        .position(|s| *s == Step::RestoreCluster)
        .unwrap();
    assert!(delete_at < restore_at);

    assert_eq!(harness.resources.started_operations("delete").await, 1);
    assert_eq!(harness.resources.poll_count("delete").await, 2);
    assert!(harness.resources.has_cluster(TARGET).await);
}

#[tokio::test]
async fn test_missing_snapshot_fails_without_retry() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();

    let mut parameters = fixtures::restore_parameters(TARGET);
    parameters.snapshot = SnapshotSelector::Date {
        date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
    };
    let op = orchestrator
        .submit(CreateOperationRequest {
            operation_id: Some("restore-2024-03-20".to_string()),
            requested_by: "alice".to_string(),
            parameters,
        })
        .unwrap();

    let outcome = orchestrator.run_until_settled(&op.id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::CheckSnapshot,
            kind: ErrorKind::NotFound
        }
    );

    let op = orchestrator.get(&op.id).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.current_step, Step::CheckSnapshot);
    assert_eq!(op.retry_count, 0);
    let error = op.last_error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert!(error.message.contains("snap-2024-03-20"));

    let failures = harness.events(&op.id, "step_failed");
    assert_eq!(failures.len(), 1);

    let published = harness.notifier.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].notification.status, OperationStatus::Failed);
    assert_eq!(published[0].notification.error.as_ref().unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_copy_polls_wait_with_growing_delays() {
    let harness = TestHarness::new().await;
    harness.resources.add_cluster(TARGET).await;
    for _ in 0..3 {
        harness.resources.push_copy_status("copying").await;
    }
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    orchestrator.run_until_settled(&id).await.unwrap();

    let trail = harness.trail(&id);
    let copy_entries: Vec<&AuditRecord> = trail
        .iter()
        .filter(|r| r.step == Some(Step::CheckCopyStatus))
        .collect();
    assert_eq!(copy_entries.len(), 4);
    assert!(copy_entries[..3]
        .iter()
        .all(|r| r.outcome == AuditOutcome::Waiting));
    assert_eq!(copy_entries[3].outcome, AuditOutcome::Success);

    let delays: Vec<u64> = copy_entries[..3]
        .iter()
        .map(|r| match r.data {
            clusterback_core::AuditEvent::StepWaiting { delay_ms, .. } => delay_ms,
            ref other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert!(delays.windows(2).all(|w| w[0] < w[1]), "delays {:?}", delays);

    // Copy success is recorded before deletion begins.
    let copy_done = copy_entries[3].sequence;
    let first_delete = trail
        .iter()
        .find(|r| r.step == Some(Step::DeleteTargetCluster))
        .unwrap();
    assert!(copy_done < first_delete.sequence);
}

#[tokio::test]
async fn test_provisioning_timeouts_are_retried() {
    let harness = TestHarness::new().await;
    for _ in 0..2 {
        harness
            .provisioner
            .push_error(ProvisionError::ConnectionTimeout {
                endpoint: "orders-restored.cluster.mock:5432".to_string(),
            })
            .await;
    }
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);
    assert_eq!(harness.provisioner.call_count().await, 3);

    let op = orchestrator.get(&id).unwrap();
    assert_eq!(op.retry_count, 0);
    assert!(op.last_error.is_none());

    let retries: Vec<AuditRecord> = harness
        .events(&id, "step_failed")
        .into_iter()
        .filter(|r| r.step == Some(Step::ProvisionUsers))
        .collect();
    assert_eq!(retries.len(), 2);
    assert!(retries.iter().all(|r| matches!(
        r.data,
        clusterback_core::AuditEvent::StepFailed {
            will_retry: true,
            kind: ErrorKind::ConnectionTimeout,
            ..
        }
    )));
}

#[tokio::test]
async fn test_auth_error_is_not_retried() {
    let harness = TestHarness::new().await;
    harness
        .provisioner
        .push_error(ProvisionError::AuthenticationFailed("bad password".to_string()))
        .await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::ProvisionUsers,
            kind: ErrorKind::AuthError
        }
    );
    assert_eq!(harness.provisioner.call_count().await, 1);
    assert_eq!(harness.notifier.published().await.len(), 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retry_budget() {
    let harness = TestHarness::new().await;
    harness
        .resources
        .add_snapshot(fixtures::SNAPSHOT_ID, "creating")
        .await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::CheckSnapshot,
            kind: ErrorKind::TransientProviderError
        }
    );

    let scheduled = harness
        .events(&id, "step_failed")
        .into_iter()
        .filter(|r| matches!(r.data, clusterback_core::AuditEvent::StepFailed { will_retry: true, .. }))
        .count();
    assert_eq!(
        scheduled,
        fixtures::fast_config().retry.max_retries as usize - 1
    );
    assert_eq!(harness.events(&id, "operation_failed").len(), 1);
    assert_eq!(harness.notifier.published().await.len(), 1);
}

#[tokio::test]
async fn test_poll_exhaustion_is_distinct_from_provider_failure() {
    let harness = TestHarness::new().await;
    let mut config = fixtures::fast_config();
    config.poll.max_poll_attempts = 3;
    for _ in 0..5 {
        harness.resources.push_copy_status("copying").await;
    }
    let orchestrator = harness.orchestrator_with(config, "executor-a");
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::CheckCopyStatus,
            kind: ErrorKind::PollExhausted
        }
    );
    assert_eq!(harness.events(&id, "step_waiting").len(), 2);

    let harness = TestHarness::new().await;
    harness
        .resources
        .push_restore_status("incompatible-network")
        .await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::CheckRestoreStatus,
            kind: ErrorKind::ProviderFailure
        }
    );
}

#[tokio::test]
async fn test_step_budget_forces_timeout() {
    let harness = TestHarness::new().await;
    let mut config = fixtures::fast_config();
    config
        .step_budgets
        .per_step
        .insert(Step::CheckCopyStatus, 0);
    for _ in 0..3 {
        harness.resources.push_copy_status("copying").await;
    }
    let orchestrator = harness.orchestrator_with(config, "executor-a");
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Failed {
            step: Step::CheckCopyStatus,
            kind: ErrorKind::Timeout
        }
    );
    assert_eq!(harness.resources.started_operations("restore").await, 0);
}

#[tokio::test]
async fn test_time_queued_does_not_count_against_first_step() {
    let harness = TestHarness::new().await;
    let mut config = fixtures::fast_config();
    config
        .step_budgets
        .per_step
        .insert(Step::CheckSnapshot, 1);
    let orchestrator = harness.orchestrator_with(config, "executor-a");
    let id = harness.submit(&orchestrator);

    // Nobody picks the operation up for longer than the budget
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);
    assert_eq!(harness.resources.started_operations("copy").await, 1);
    assert!(orchestrator.get(&id).unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_restart_resumes_without_rerunning_steps() {
    let harness = TestHarness::new().await;
    for _ in 0..2 {
        harness.resources.push_copy_status("copying").await;
    }
    let id = {
        let first = harness.orchestrator();
        let id = harness.submit(&first);
        let outcome = first.drive(&id).await.unwrap();
        assert!(matches!(
            outcome,
            DriveOutcome::Suspended {
                step: Step::CheckCopyStatus,
                ..
            }
        ));
        id
    };

    let persisted = harness.store.get(&id).unwrap().unwrap();
    assert_eq!(persisted.status, OperationStatus::Waiting);
    assert!(persisted.outputs.copy_request.is_some());

    let second = harness.restarted_orchestrator("executor-b");
    let outcome = second.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);

    assert_eq!(harness.resources.start_requests("copy").await, 1);
    assert_eq!(harness.resources.start_requests("restore").await, 1);
    assert!(graph::is_valid_path(&harness.step_path(&id)));
    assert_eq!(harness.events(&id, "step_succeeded").iter().filter(|r| r.step == Some(Step::CheckSnapshot)).count(), 1);
}

#[tokio::test]
async fn test_recorded_output_is_not_executed_again() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    // A crash after the copy output was written but before the step moved on.
    let mut op = harness.store.get(&id).unwrap().unwrap();
    let expected = op.version;
    op.outputs = fixtures::outputs_through(Step::CopySnapshot);
    op.current_step = Step::CopySnapshot;
    op.status = OperationStatus::InProgress;
    harness.store.conditional_update(&op, expected).unwrap();

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);
    assert_eq!(harness.resources.start_requests("copy").await, 0);
    assert_eq!(harness.resources.poll_count("copy").await, 1);
}

#[tokio::test]
async fn test_live_lease_blocks_second_executor() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    harness
        .store
        .acquire_lease(&id, "executor-other", Duration::from_secs(60))
        .unwrap();

    let outcome = orchestrator.drive(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::LeaseConflict {
            holder: "executor-other".to_string()
        }
    );

    let op = orchestrator.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.version, 1);
    assert!(harness.step_path(&id).is_empty());
}

#[tokio::test]
async fn test_stale_lease_is_reclaimed() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    harness
        .store
        .acquire_lease(&id, "executor-crashed", Duration::from_millis(1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);
}

#[tokio::test]
async fn test_concurrent_executors_do_not_duplicate_steps() {
    let harness = TestHarness::new().await;
    let a = harness.orchestrator_with(fixtures::fast_config(), "executor-a");
    let b = harness.orchestrator_with(fixtures::fast_config(), "executor-b");
    let id = harness.submit(&a);

    let (ra, rb) = tokio::join!(a.run_until_settled(&id), b.run_until_settled(&id));
    let outcomes = [ra.unwrap(), rb.unwrap()];
    assert!(outcomes.iter().any(|o| *o == DriveOutcome::Succeeded));

    for step in [Step::CheckSnapshot, Step::CopySnapshot, Step::RestoreCluster] {
        let count = harness
            .events(&id, "step_succeeded")
            .iter()
            .filter(|r| r.step == Some(step))
            .count();
        assert_eq!(count, 1, "step {} advanced more than once", step);
    }
    assert_eq!(harness.resources.started_operations("copy").await, 1);
    assert_eq!(harness.notifier.published().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_at_poll_boundary() {
    let harness = TestHarness::new().await;
    for _ in 0..5 {
        harness.resources.push_copy_status("copying").await;
    }
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.drive(&id).await.unwrap();
    assert!(matches!(outcome, DriveOutcome::Suspended { .. }));

    let op = orchestrator.cancel(&id, "bob").unwrap();
    assert_eq!(op.status, OperationStatus::Cancelling);

    let outcome = orchestrator.drive(&id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Cancelled {
            step: Step::CheckCopyStatus
        }
    );

    let op = orchestrator.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert_eq!(op.last_error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(harness.resources.start_requests("restore").await, 0);
    assert_eq!(harness.resources.poll_count("copy").await, 1);

    let published = harness.notifier.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].notification.status, OperationStatus::Cancelled);
}

#[tokio::test]
async fn test_archive_failure_only_warns() {
    let harness = TestHarness::new().await;
    harness
        .resources
        .fail_next_delete_snapshot(ResourceError::PermissionDenied("kms".to_string()))
        .await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);

    let degraded = harness.events(&id, "step_degraded");
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0].step, Some(Step::ArchiveSnapshot));
    assert_eq!(degraded[0].outcome, AuditOutcome::Warning);

    let op = orchestrator.get(&id).unwrap();
    assert!(!op.outputs.archive.as_ref().unwrap().archived);
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_restore() {
    let harness = TestHarness::new().await;
    harness.notifier.set_failing(true).await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    let outcome = orchestrator.run_until_settled(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Succeeded);
    assert_eq!(harness.notifier.attempts().await, 1);
    assert_eq!(harness.events(&id, "notification_failed").len(), 1);

    let op = orchestrator.get(&id).unwrap();
    assert!(!op.outputs.notification.as_ref().unwrap().delivered);
}

#[tokio::test]
async fn test_success_publishes_exactly_once() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    orchestrator.run_until_settled(&id).await.unwrap();
    // Driving a finished operation is a no-op.
    let again = orchestrator.drive(&id).await.unwrap();
    assert_eq!(
        again,
        DriveOutcome::AlreadyTerminal {
            status: OperationStatus::Succeeded
        }
    );

    let published = harness.notifier.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "cluster-restore");
    assert_eq!(
        published[0].notification.endpoint.as_deref(),
        Some("orders-restored.cluster.mock")
    );
    assert_eq!(harness.events(&id, "notification_published").len(), 1);
}

#[tokio::test]
async fn test_secrets_are_read_for_provisioning() {
    let harness = TestHarness::new().await;
    let orchestrator = harness.orchestrator();
    let id = harness.submit(&orchestrator);

    orchestrator.run_until_settled(&id).await.unwrap();

    assert_eq!(harness.secrets.lookups().await, vec!["master", "app"]);
    let calls = harness.provisioner.recorded_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].endpoint, "orders-restored.cluster.mock");
}
