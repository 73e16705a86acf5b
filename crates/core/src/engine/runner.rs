//! Restore orchestrator implementation.
//!
//! `drive` advances one operation as far as it can go without waiting:
//! it takes the operation's lease, runs step handlers and persists every
//! transition through a version-checked write. Waits are never spent in
//! memory; they become `next_run_at` and the operation is picked up again by
//! the scheduler loop of whichever executor gets there first.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecord, AuditStore};
use crate::config::{ConfigProvider, EnvProvider, LayeredConfig, MapProvider};
use crate::metrics;
use crate::operation::{
    CreateOperationRequest, ErrorKind, Operation, OperationFilter, OperationStatus,
    OperationStore, SnapshotSelector, Step, StepError, StepOutput, StoreError,
};

use super::backoff::Backoff;
use super::config::OrchestratorConfig;
use super::graph;
use super::handlers::{summarize, Collaborators, StepContext, StepHandlers};
use super::types::{DriveOutcome, OrchestratorError, OrchestratorStatus, StepFailure, StepOutcome};

/// Prefix of environment variables consulted by the layered settings lookup.
pub const SETTINGS_ENV_PREFIX: &str = "CLUSTERBACK_";

const CANCEL_ATTEMPTS: usize = 5;

enum Flow {
    Continue,
    Stop(DriveOutcome),
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now + chrono::Duration::milliseconds(millis)
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn selector_label(selector: &SnapshotSelector) -> String {
    match selector {
        SnapshotSelector::Identifier { id } => id.clone(),
        SnapshotSelector::Date { date } => date.format("%Y-%m-%d").to_string(),
    }
}

/// The restore orchestrator.
#[derive(Clone)]
pub struct RestoreOrchestrator {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn OperationStore>,
    audit: Arc<dyn AuditStore>,
    handlers: Arc<StepHandlers>,
    retry_backoff: Backoff,
    executor_id: String,
    env_settings: Arc<dyn ConfigProvider>,
    remote_settings: Arc<dyn ConfigProvider>,

    // Runtime state
    running: Arc<AtomicBool>,
    in_flight: Arc<RwLock<HashSet<String>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RestoreOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn OperationStore>,
        audit: Arc<dyn AuditStore>,
        collaborators: Collaborators,
    ) -> Self {
        let config = Arc::new(config);
        let (shutdown_tx, _) = broadcast::channel(1);
        let retry_backoff =
            Backoff::from_millis(config.retry.base_delay_ms, config.retry.max_delay_ms);

        Self {
            handlers: Arc::new(StepHandlers::new(collaborators, Arc::clone(&config))),
            config,
            store,
            audit,
            retry_backoff,
            executor_id: format!("executor-{}", Uuid::new_v4()),
            env_settings: Arc::new(EnvProvider::new(SETTINGS_ENV_PREFIX)),
            remote_settings: Arc::new(MapProvider::new("remote", BTreeMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            shutdown_tx,
        }
    }

    /// Use a fixed executor identity for leases.
    pub fn with_executor_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    /// Lowest-precedence settings layer.
    pub fn with_remote_settings(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.remote_settings = provider;
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_settings = Arc::new(EnvProvider::new(prefix));
        self
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Record a new restore request.
    pub fn submit(&self, request: CreateOperationRequest) -> Result<Operation, OrchestratorError> {
        let operation = self.store.create(request)?;
        self.record(AuditEvent::OperationCreated {
            operation_id: operation.id.clone(),
            requested_by: operation.requested_by.clone(),
            target_cluster_id: operation.parameters.target_cluster_id.clone(),
            snapshot: selector_label(&operation.parameters.snapshot),
        })?;
        metrics::OPERATIONS_CREATED.inc();

        info!(
            operation_id = %operation.id,
            target_cluster_id = %operation.parameters.target_cluster_id,
            requested_by = %operation.requested_by,
            "Restore operation created"
        );
        Ok(operation)
    }

    pub fn get(&self, id: &str) -> Result<Operation, OrchestratorError> {
        self.store
            .get(id)?
            .ok_or_else(|| OrchestratorError::OperationNotFound(id.to_string()))
    }

    /// Advance an operation until it waits, finishes or loses its lease.
    pub async fn drive(&self, id: &str) -> Result<DriveOutcome, OrchestratorError> {
        let operation = self.get(id)?;
        if operation.status.is_terminal() {
            return Ok(DriveOutcome::AlreadyTerminal {
                status: operation.status,
            });
        }

        if let Some(outcome) = self.take_lease(id)? {
            return Ok(outcome);
        }

        let result = self.drive_leased(id).await;

        if let Err(e) = self.store.release_lease(id, &self.executor_id) {
            warn!(operation_id = %id, error = %e, "Failed to release lease");
        }
        result
    }

    /// Drive repeatedly, sleeping through suspensions, until the operation
    /// settles or another executor owns it.
    pub async fn run_until_settled(&self, id: &str) -> Result<DriveOutcome, OrchestratorError> {
        loop {
            match self.drive(id).await? {
                DriveOutcome::Suspended { until, .. } => {
                    let wait = (until - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }
                DriveOutcome::Superseded => tokio::task::yield_now().await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Request cancellation. The executor observes it before its next step.
    pub fn cancel(&self, id: &str, requested_by: &str) -> Result<Operation, OrchestratorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut operation = self.get(id)?;
            if operation.status == OperationStatus::Cancelling {
                return Ok(operation);
            }
            if !operation.status.can_cancel() {
                return Err(OrchestratorError::InvalidState {
                    operation_id: id.to_string(),
                    status: operation.status,
                    action: "cancel".to_string(),
                });
            }
            // The restore is complete once NOTIFY runs; its success
            // notification may already be out.
            if matches!(operation.current_step, Step::Notify | Step::Done) {
                return Err(OrchestratorError::InvalidState {
                    operation_id: id.to_string(),
                    status: operation.status,
                    action: format!("cancel at step {}", operation.current_step),
                });
            }

            let previous_status = operation.status;
            let expected = operation.version;
            operation.status = OperationStatus::Cancelling;
            operation.cancel_requested_by = Some(requested_by.to_string());
            operation.next_run_at = None;

            match self.store.conditional_update(&operation, expected) {
                Ok(stored) => {
                    self.record(AuditEvent::CancelRequested {
                        operation_id: id.to_string(),
                        requested_by: requested_by.to_string(),
                        previous_status,
                    })?;
                    info!(operation_id = %id, requested_by, "Cancellation requested");
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < CANCEL_ATTEMPTS => {
                    metrics::VERSION_CONFLICTS.inc();
                    debug!(operation_id = %id, attempt, "Cancel raced with a step write, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drive now, skipping any pending poll or retry delay.
    pub async fn resume(&self, id: &str) -> Result<DriveOutcome, OrchestratorError> {
        let mut operation = self.get(id)?;
        if operation.status.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                operation_id: id.to_string(),
                status: operation.status,
                action: "resume".to_string(),
            });
        }

        if operation.next_run_at.is_some_and(|at| at > Utc::now()) {
            let expected = operation.version;
            operation.next_run_at = None;
            self.store.conditional_update(&operation, expected)?;
            info!(operation_id = %id, "Operation resumed ahead of schedule");
        }

        self.drive(id).await
    }

    /// Start the scheduler loop.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!(executor_id = %self.executor_id, "Starting restore orchestrator");

        self.log_recoverable();
        self.spawn_scheduler_loop();

        info!("Restore orchestrator started");
    }

    /// Stop the scheduler loop and wait briefly for in-flight drives.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping restore orchestrator");

        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.in_flight.read().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.read().await.len();
        if remaining > 0 {
            warn!(remaining, "Stopped with operations still in flight; their leases will expire");
        }

        info!("Restore orchestrator stopped");
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let count = |status: OperationStatus| self.count_status(status).unwrap_or(0) as usize;

        OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            executor_id: self.executor_id.clone(),
            in_flight: self.in_flight.read().await.len(),
            pending_count: count(OperationStatus::Pending),
            in_progress_count: count(OperationStatus::InProgress),
            waiting_count: count(OperationStatus::Waiting),
            cancelling_count: count(OperationStatus::Cancelling),
            succeeded_count: count(OperationStatus::Succeeded),
            failed_count: count(OperationStatus::Failed),
            cancelled_count: count(OperationStatus::Cancelled),
        }
    }

    /// Dispatch due operations up to the concurrency limit.
    pub async fn dispatch_due(&self) -> Result<usize, OrchestratorError> {
        let busy = self.in_flight.read().await.len();
        let capacity = self.config.max_concurrent_operations.saturating_sub(busy);
        if capacity == 0 {
            return Ok(0);
        }

        let due = self
            .store
            .list_due(Utc::now(), (capacity + busy) as i64)?;

        let mut dispatched = 0;
        for operation in due {
            if dispatched >= capacity {
                break;
            }
            if !self.in_flight.write().await.insert(operation.id.clone()) {
                continue;
            }
            dispatched += 1;

            let this = self.clone();
            let id = operation.id;
            tokio::spawn(async move {
                match this.drive(&id).await {
                    Ok(outcome) => debug!(operation_id = %id, ?outcome, "Drive finished"),
                    Err(e) => error!(operation_id = %id, error = %e, "Drive failed"),
                }
                this.in_flight.write().await.remove(&id);
            });
        }

        Ok(dispatched)
    }

    /// Operations in `status`, or `None` when the store cannot say.
    fn count_status(&self, status: OperationStatus) -> Option<i64> {
        match self.store.count(&OperationFilter::new().with_status(status)) {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(status = status.as_str(), error = %e, "Failed to count operations");
                None
            }
        }
    }

    fn log_recoverable(&self) {
        let total: i64 = OperationStatus::active()
            .into_iter()
            .filter_map(|status| self.count_status(status))
            .sum();
        if total > 0 {
            info!(count = total, "Found unfinished restore operations to resume");
        }
    }

    fn spawn_scheduler_loop(&self) {
        let this = self.clone();
        let interval = self.config.scheduler_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Scheduler loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduler loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = this.dispatch_due().await {
                            warn!("Failed to dispatch due operations: {}", e);
                        }
                    }
                }
            }
            info!("Scheduler loop stopped");
        });
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// `Some` when the lease is held elsewhere.
    fn take_lease(&self, id: &str) -> Result<Option<DriveOutcome>, OrchestratorError> {
        match self
            .store
            .acquire_lease(id, &self.executor_id, self.config.lease_ttl())
        {
            Ok(_) => Ok(None),
            Err(StoreError::LeaseConflict { holder, .. }) => {
                metrics::LEASE_CONFLICTS.inc();
                debug!(operation_id = %id, holder = %holder, "Operation leased by another executor");
                Ok(Some(DriveOutcome::LeaseConflict { holder }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drive_leased(&self, id: &str) -> Result<DriveOutcome, OrchestratorError> {
        loop {
            let operation = self.get(id)?;
            if operation.status.is_terminal() {
                return Ok(DriveOutcome::AlreadyTerminal {
                    status: operation.status,
                });
            }
            if let Some(outcome) = self.take_lease(id)? {
                return Ok(outcome);
            }

            match self.step_once(operation).await? {
                Flow::Continue => continue,
                Flow::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    async fn step_once(&self, mut operation: Operation) -> Result<Flow, OrchestratorError> {
        let now = Utc::now();
        let step = operation.current_step;

        if operation.status == OperationStatus::Cancelling {
            return self.finish_cancelled(operation).await;
        }
        if let Some(until) = operation.next_run_at.filter(|at| *at > now) {
            return Ok(Flow::Stop(DriveOutcome::Suspended { step, until }));
        }
        if step == Step::Done {
            return self.finish_succeeded(operation);
        }

        // Time queued before the first pass does not count against the
        // first step's budget.
        if operation.status == OperationStatus::Pending {
            let expected = operation.version;
            operation.status = OperationStatus::InProgress;
            operation.step_started_at = now;
            if self.persist(&operation, expected)?.is_none() {
                return Ok(Flow::Stop(DriveOutcome::Superseded));
            }
            self.record(AuditEvent::OperationStarted {
                operation_id: operation.id.clone(),
                executor: self.executor_id.clone(),
            })?;
            info!(operation_id = %operation.id, executor = %self.executor_id, "Restore operation started");
            return Ok(Flow::Continue);
        }

        let budget = self.config.budget_for(step);
        let elapsed = (now - operation.step_started_at).to_std().unwrap_or_default();
        if elapsed > budget {
            let failure = StepFailure::timeout(format!(
                "step {} exceeded its budget of {}s",
                step,
                budget.as_secs()
            ));
            return self.fail_operation(operation, failure).await;
        }

        // A rerun after a crash between recording an output and moving on.
        if operation.outputs.has(step) {
            debug!(operation_id = %operation.id, step = %step, "Step output already recorded");
            return self.transition(operation, None, None);
        }

        let settings = self.settings_for(&operation);
        let timer = metrics::STEP_DURATION
            .with_label_values(&[step.as_str()])
            .start_timer();
        let outcome = self
            .handlers
            .run(&StepContext {
                operation: &operation,
                settings: &settings,
            })
            .await;
        timer.observe_duration();

        match outcome {
            StepOutcome::Advance(output) => self.advance(operation, output, None),
            StepOutcome::Degraded { output, warning } => {
                self.advance(operation, output, Some(warning))
            }
            StepOutcome::Wait { delay, status } => self.wait(operation, delay, status),
            StepOutcome::Fail(failure) => self.fail_step(operation, failure).await,
        }
    }

    fn advance(
        &self,
        mut operation: Operation,
        output: StepOutput,
        warning: Option<String>,
    ) -> Result<Flow, OrchestratorError> {
        let summary = summarize(&output);
        let receipt = match &output {
            StepOutput::Notification(receipt) => Some(receipt.clone()),
            _ => None,
        };

        if let Err(conflict) = operation.outputs.merge(output) {
            warn!(operation_id = %operation.id, step = %conflict.0, "Output slot already filled, keeping the recorded value");
        }
        self.transition(operation, Some((summary, warning)), receipt)
    }

    /// Move to the next step and persist.
    fn transition(
        &self,
        mut operation: Operation,
        report: Option<(String, Option<String>)>,
        receipt: Option<crate::operation::NotificationReceipt>,
    ) -> Result<Flow, OrchestratorError> {
        let step = operation.current_step;
        let next_step = graph::next_step(step, &operation.outputs);
        let expected = operation.version;

        operation.current_step = next_step;
        operation.status = OperationStatus::InProgress;
        operation.retry_count = 0;
        operation.poll_attempt = 0;
        operation.last_error = None;
        operation.step_started_at = Utc::now();
        operation.next_run_at = None;

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        let (summary, warning) =
            report.unwrap_or_else(|| ("output already recorded".to_string(), None));
        let outcome_label = if warning.is_some() { "warning" } else { "success" };
        let event = match warning {
            Some(warning) => {
                warn!(operation_id = %stored.id, step = %step, warning = %warning, "Step completed with a warning");
                AuditEvent::StepDegraded {
                    operation_id: stored.id.clone(),
                    step,
                    next_step,
                    warning,
                }
            }
            None => AuditEvent::StepSucceeded {
                operation_id: stored.id.clone(),
                step,
                next_step,
                summary,
            },
        };
        self.record(event)?;
        metrics::STEP_TRANSITIONS
            .with_label_values(&[step.as_str(), outcome_label])
            .inc();

        if let Some(receipt) = receipt {
            self.record_notification(
                &stored.id,
                &receipt.topic,
                OperationStatus::Succeeded,
                if receipt.delivered {
                    Ok(())
                } else {
                    Err("delivery failed".to_string())
                },
            )?;
        }

        info!(operation_id = %stored.id, from = %step, to = %next_step, "Step completed");
        Ok(Flow::Continue)
    }

    fn wait(
        &self,
        mut operation: Operation,
        delay: Duration,
        provider_status: String,
    ) -> Result<Flow, OrchestratorError> {
        let step = operation.current_step;
        let expected = operation.version;
        let until = after(Utc::now(), delay);

        operation.status = OperationStatus::Waiting;
        operation.poll_attempt += 1;
        operation.next_run_at = Some(until);

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        self.record(AuditEvent::StepWaiting {
            operation_id: stored.id.clone(),
            step,
            poll_attempt: stored.poll_attempt,
            delay_ms: millis(delay),
            provider_status: provider_status.clone(),
        })?;
        metrics::POLL_WAITS.with_label_values(&[step.as_str()]).inc();
        metrics::STEP_TRANSITIONS
            .with_label_values(&[step.as_str(), "waiting"])
            .inc();

        debug!(
            operation_id = %stored.id,
            step = %step,
            attempt = stored.poll_attempt,
            provider_status = %provider_status,
            "Provider operation still running"
        );
        Ok(Flow::Stop(DriveOutcome::Suspended { step, until }))
    }

    async fn fail_step(
        &self,
        mut operation: Operation,
        failure: StepFailure,
    ) -> Result<Flow, OrchestratorError> {
        let step = operation.current_step;
        if !failure.is_retryable() {
            return self.fail_operation(operation, failure).await;
        }

        let retry_count = operation.retry_count + 1;
        let max_retries = self.config.max_retries_for(step);
        operation.retry_count = retry_count;
        if retry_count >= max_retries {
            return self.fail_operation(operation, failure).await;
        }

        let now = Utc::now();
        let delay = self.retry_backoff.delay(retry_count);
        let until = after(now, delay);
        let expected = operation.version;

        operation.status = OperationStatus::Waiting;
        operation.next_run_at = Some(until);
        operation.last_error = Some(StepError {
            step,
            kind: failure.kind,
            message: failure.message.clone(),
            at: now,
        });

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        self.record(AuditEvent::StepFailed {
            operation_id: stored.id.clone(),
            step,
            kind: failure.kind,
            message: failure.message.clone(),
            retry_count,
            will_retry: true,
            retry_delay_ms: Some(millis(delay)),
        })?;
        metrics::RETRY_ATTEMPTS
            .with_label_values(&[step.as_str(), failure.kind.as_str()])
            .inc();

        warn!(
            operation_id = %stored.id,
            step = %step,
            attempt = retry_count,
            max_retries,
            delay_ms = millis(delay),
            "Retryable step failure: {}",
            failure
        );
        Ok(Flow::Stop(DriveOutcome::Suspended { step, until }))
    }

    async fn fail_operation(
        &self,
        mut operation: Operation,
        failure: StepFailure,
    ) -> Result<Flow, OrchestratorError> {
        let step = operation.current_step;
        let expected = operation.version;

        operation.status = OperationStatus::Failed;
        operation.next_run_at = None;
        operation.last_error = Some(StepError {
            step,
            kind: failure.kind,
            message: failure.message.clone(),
            at: Utc::now(),
        });

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        self.record(AuditEvent::StepFailed {
            operation_id: stored.id.clone(),
            step,
            kind: failure.kind,
            message: failure.message.clone(),
            retry_count: stored.retry_count,
            will_retry: false,
            retry_delay_ms: None,
        })?;
        self.record(AuditEvent::OperationFailed {
            operation_id: stored.id.clone(),
            step,
            kind: failure.kind,
            message: failure.message.clone(),
        })?;
        metrics::STEP_TRANSITIONS
            .with_label_values(&[step.as_str(), "failure"])
            .inc();
        self.observe_finished(&stored, "failed");

        error!(operation_id = %stored.id, step = %step, "Restore operation failed: {}", failure);

        self.publish_final(&stored, OperationStatus::Failed).await?;
        Ok(Flow::Stop(DriveOutcome::Failed {
            step,
            kind: failure.kind,
        }))
    }

    async fn finish_cancelled(&self, mut operation: Operation) -> Result<Flow, OrchestratorError> {
        let step = operation.current_step;
        let expected = operation.version;
        let cancelled_by = operation
            .cancel_requested_by
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        operation.status = OperationStatus::Cancelled;
        operation.next_run_at = None;
        operation.last_error = Some(StepError {
            step,
            kind: ErrorKind::Cancelled,
            message: format!("cancelled by {}", cancelled_by),
            at: Utc::now(),
        });

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        self.record(AuditEvent::OperationCancelled {
            operation_id: stored.id.clone(),
            step,
            cancelled_by: cancelled_by.clone(),
        })?;
        self.observe_finished(&stored, "cancelled");
        info!(operation_id = %stored.id, step = %step, cancelled_by = %cancelled_by, "Restore operation cancelled");

        self.publish_final(&stored, OperationStatus::Cancelled).await?;
        Ok(Flow::Stop(DriveOutcome::Cancelled { step }))
    }

    fn finish_succeeded(&self, mut operation: Operation) -> Result<Flow, OrchestratorError> {
        let expected = operation.version;
        operation.status = OperationStatus::Succeeded;
        operation.next_run_at = None;

        let Some(stored) = self.persist(&operation, expected)? else {
            return Ok(Flow::Stop(DriveOutcome::Superseded));
        };

        let duration_secs = (stored.updated_at - stored.created_at).num_seconds();
        self.record(AuditEvent::OperationSucceeded {
            operation_id: stored.id.clone(),
            duration_secs,
        })?;
        self.observe_finished(&stored, "succeeded");

        info!(
            operation_id = %stored.id,
            target_cluster_id = %stored.parameters.target_cluster_id,
            duration_secs,
            "Restore operation succeeded"
        );
        Ok(Flow::Stop(DriveOutcome::Succeeded))
    }

    async fn publish_final(
        &self,
        operation: &Operation,
        status: OperationStatus,
    ) -> Result<(), OrchestratorError> {
        let settings = self.settings_for(operation);
        let (topic, result) = self
            .handlers
            .publish_final(operation, status, &settings)
            .await;
        if let Err(e) = &result {
            warn!(operation_id = %operation.id, topic = %topic, error = %e, "Failed to publish notification");
        }
        self.record_notification(
            &operation.id,
            &topic,
            status,
            result.map_err(|e| e.to_string()),
        )
    }

    fn record_notification(
        &self,
        operation_id: &str,
        topic: &str,
        status: OperationStatus,
        result: Result<(), String>,
    ) -> Result<(), OrchestratorError> {
        let (label, event) = match result {
            Ok(()) => (
                "delivered",
                AuditEvent::NotificationPublished {
                    operation_id: operation_id.to_string(),
                    topic: topic.to_string(),
                    status,
                },
            ),
            Err(error) => (
                "failed",
                AuditEvent::NotificationFailed {
                    operation_id: operation_id.to_string(),
                    topic: topic.to_string(),
                    error,
                },
            ),
        };
        metrics::NOTIFICATIONS
            .with_label_values(&[status.as_str(), label])
            .inc();
        self.record(event)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Version-checked write. `None` when another writer got there first.
    fn persist(
        &self,
        operation: &Operation,
        expected: u64,
    ) -> Result<Option<Operation>, OrchestratorError> {
        match self.store.conditional_update(operation, expected) {
            Ok(stored) => Ok(Some(stored)),
            Err(StoreError::VersionConflict { actual, .. }) => {
                metrics::VERSION_CONFLICTS.inc();
                debug!(
                    operation_id = %operation.id,
                    expected,
                    actual,
                    "Operation changed underneath executor, stopping"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self, event: AuditEvent) -> Result<(), OrchestratorError> {
        self.audit.append(&AuditRecord::new(event))?;
        Ok(())
    }

    fn observe_finished(&self, operation: &Operation, result: &str) {
        metrics::OPERATIONS_FINISHED.with_label_values(&[result]).inc();
        let secs = (Utc::now() - operation.created_at).num_milliseconds() as f64 / 1000.0;
        metrics::OPERATION_DURATION
            .with_label_values(&[result])
            .observe(secs.max(0.0));
    }

    /// Trigger options, then recorded outputs, then environment, then remote.
    fn settings_for(&self, operation: &Operation) -> LayeredConfig {
        LayeredConfig::new()
            .with_layer(Arc::new(MapProvider::new(
                "trigger",
                operation.parameters.options.clone(),
            )))
            .with_layer(Arc::new(MapProvider::new(
                "outputs",
                operation.outputs.as_settings(),
            )))
            .with_layer(Arc::clone(&self.env_settings))
            .with_layer(Arc::clone(&self.remote_settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SqliteAuditStore;
    use crate::operation::SqliteOperationStore;
    use crate::testing::{
        fixtures, MockNotificationSink, MockProvisioner, MockResourceControl, MockSecretStore,
    };

    fn orchestrator() -> (RestoreOrchestrator, Arc<MockResourceControl>) {
        let resources = Arc::new(MockResourceControl::new());
        let orchestrator = RestoreOrchestrator::new(
            fixtures::fast_config(),
            Arc::new(SqliteOperationStore::in_memory().unwrap()),
            Arc::new(SqliteAuditStore::in_memory().unwrap()),
            Collaborators {
                resources: resources.clone(),
                secrets: Arc::new(MockSecretStore::with_defaults()),
                provisioner: Arc::new(MockProvisioner::new()),
                notifier: Arc::new(MockNotificationSink::new()),
            },
        )
        .with_executor_id("test-executor")
        .with_env_prefix("CLUSTERBACK_RUNNER_TEST_");
        (orchestrator, resources)
    }

    #[test]
    fn test_after_adds_delay() {
        let now = Utc::now();
        assert_eq!(
            after(now, Duration::from_millis(1500)) - now,
            chrono::Duration::milliseconds(1500)
        );
    }

    #[tokio::test]
    async fn test_status_default_counts() {
        let (orchestrator, _) = orchestrator();
        let status = orchestrator.status().await;
        assert!(!status.running);
        assert_eq!(status.executor_id, "test-executor");
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test]
    async fn test_submit_then_drive_unknown_fails() {
        let (orchestrator, _) = orchestrator();
        let op = orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(orchestrator.status().await.pending_count, 1);

        let err = orchestrator.drive("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::OperationNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_rejected() {
        let (orchestrator, _) = orchestrator();
        let op = orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();

        // Snapshot is not registered, so the first step fails terminally.
        let outcome = orchestrator.drive(&op.id).await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Failed { kind: ErrorKind::NotFound, .. }));

        let err = orchestrator.cancel(&op.id, "alice").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
        let err = orchestrator.resume(&op.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (orchestrator, _) = orchestrator();
        let op = orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();

        let first = orchestrator.cancel(&op.id, "alice").unwrap();
        let second = orchestrator.cancel(&op.id, "bob").unwrap();
        assert_eq!(first.status, OperationStatus::Cancelling);
        assert_eq!(second.cancel_requested_by.as_deref(), Some("alice"));

        let outcome = orchestrator.drive(&op.id).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Cancelled { step: Step::CheckSnapshot });
    }

    #[tokio::test]
    async fn test_scheduler_loop_drives_due_operations() {
        let (orchestrator, resources) = orchestrator();
        resources
            .add_snapshot(fixtures::SNAPSHOT_ID, "available")
            .await;
        let op = orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();

        orchestrator.start().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = orchestrator.get(&op.id).unwrap();
            if current.status.is_terminal() || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        orchestrator.stop().await;

        assert_eq!(
            orchestrator.get(&op.id).unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_cancel_rejected_once_notifying() {
        let (orchestrator, _) = orchestrator();
        let mut op = orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();
        let expected = op.version;
        op.status = OperationStatus::InProgress;
        op.current_step = Step::Notify;
        orchestrator.store.conditional_update(&op, expected).unwrap();

        let err = orchestrator.cancel(&op.id, "alice").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
        assert!(err.to_string().contains("notify"));

        let current = orchestrator.get(&op.id).unwrap();
        assert_eq!(current.status, OperationStatus::InProgress);
        assert!(current.cancel_requested_by.is_none());
    }

    /// Delegates to SQLite but cannot count.
    struct UncountableStore(SqliteOperationStore);

    impl OperationStore for UncountableStore {
        fn create(&self, request: CreateOperationRequest) -> Result<Operation, StoreError> {
            self.0.create(request)
        }
        fn get(&self, id: &str) -> Result<Option<Operation>, StoreError> {
            self.0.get(id)
        }
        fn conditional_update(
            &self,
            operation: &Operation,
            expected_version: u64,
        ) -> Result<Operation, StoreError> {
            self.0.conditional_update(operation, expected_version)
        }
        fn delete(&self, id: &str) -> Result<Operation, StoreError> {
            self.0.delete(id)
        }
        fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>, StoreError> {
            self.0.list(filter)
        }
        fn count(&self, _filter: &OperationFilter) -> Result<i64, StoreError> {
            Err(StoreError::Database("disk I/O error".to_string()))
        }
        fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Operation>, StoreError> {
            self.0.list_due(now, limit)
        }
        fn acquire_lease(
            &self,
            id: &str,
            owner: &str,
            ttl: Duration,
        ) -> Result<crate::operation::Lease, StoreError> {
            self.0.acquire_lease(id, owner, ttl)
        }
        fn release_lease(&self, id: &str, owner: &str) -> Result<(), StoreError> {
            self.0.release_lease(id, owner)
        }
    }

    #[tokio::test]
    async fn test_status_survives_count_errors() {
        let orchestrator = RestoreOrchestrator::new(
            fixtures::fast_config(),
            Arc::new(UncountableStore(SqliteOperationStore::in_memory().unwrap())),
            Arc::new(SqliteAuditStore::in_memory().unwrap()),
            Collaborators {
                resources: Arc::new(MockResourceControl::new()),
                secrets: Arc::new(MockSecretStore::with_defaults()),
                provisioner: Arc::new(MockProvisioner::new()),
                notifier: Arc::new(MockNotificationSink::new()),
            },
        );
        orchestrator
            .submit(fixtures::create_request("orders-restored"))
            .unwrap();

        assert_eq!(orchestrator.count_status(OperationStatus::Pending), None);
        let status = orchestrator.status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.failed_count, 0);
    }
}
