//! Orchestrator configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::operation::Step;

/// Configuration for the restore orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Run the background worker loop.
    /// When disabled, operations are only driven through explicit resume calls.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the worker looks for due operations (milliseconds).
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_ms: u64,

    /// Operations driven concurrently by this executor.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    /// Lease duration. An executor that dies loses its claim after this long.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub step_budgets: StepBudgets,

    /// What a failed ARCHIVE_SNAPSHOT does to the operation.
    #[serde(default)]
    pub archive_failure_policy: ArchiveFailurePolicy,

    /// Default snapshot naming template for date selectors.
    /// Placeholders: `{date}` (YYYY-MM-DD) and `{cluster}` (source cluster id).
    #[serde(default = "default_snapshot_template")]
    pub snapshot_name_template: String,

    /// Topic passed to the notification sink.
    #[serde(default = "default_topic")]
    pub notification_topic: String,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

/// Status polling of asynchronous provider operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_base")]
    pub base_interval_ms: u64,
    #[serde(default = "default_poll_max")]
    pub max_interval_ms: u64,
    /// Polls allowed per asynchronous operation before PollExhausted.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

/// Retry policy for retryable step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts of one step after which the operation fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub max_delay_ms: u64,
    /// Per-step overrides of `max_retries`.
    #[serde(default)]
    pub per_step: BTreeMap<Step, u32>,
}

/// Wall-clock budget per step, measured from when the step started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBudgets {
    #[serde(default = "default_budget")]
    pub default_secs: u64,
    #[serde(default = "default_step_budgets")]
    pub per_step: BTreeMap<Step, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFailurePolicy {
    /// Record a warning and continue to NOTIFY.
    #[default]
    Warn,
    /// Treat the failure like any other step failure.
    Fail,
}

/// Database users created on the restored cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Secret holding the cluster's master credentials.
    #[serde(default = "default_master_secret")]
    pub master_secret_id: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub users: Vec<UserGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrant {
    /// Secret holding this user's credentials.
    pub secret_id: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_scheduler_interval() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_poll_base() -> u64 {
    30_000
}

fn default_poll_max() -> u64 {
    600_000
}

fn default_max_poll_attempts() -> u32 {
    240
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    5_000
}

fn default_retry_max() -> u64 {
    300_000
}

fn default_budget() -> u64 {
    1800 // 30 minutes
}

fn default_step_budgets() -> BTreeMap<Step, u64> {
    BTreeMap::from([
        (Step::CheckCopyStatus, 6 * 3600),
        (Step::CheckDeleteStatus, 2 * 3600),
        (Step::CheckRestoreStatus, 4 * 3600),
    ])
}

fn default_snapshot_template() -> String {
    "snap-{date}".to_string()
}

fn default_topic() -> String {
    "cluster-restore".to_string()
}

fn default_master_secret() -> String {
    "master".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scheduler_interval_ms: default_scheduler_interval(),
            max_concurrent_operations: default_max_concurrent(),
            lease_ttl_secs: default_lease_ttl(),
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
            step_budgets: StepBudgets::default(),
            archive_failure_policy: ArchiveFailurePolicy::default(),
            snapshot_name_template: default_snapshot_template(),
            notification_topic: default_topic(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_poll_base(),
            max_interval_ms: default_poll_max(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base(),
            max_delay_ms: default_retry_max(),
            per_step: BTreeMap::new(),
        }
    }
}

impl Default for StepBudgets {
    fn default() -> Self {
        Self {
            default_secs: default_budget(),
            per_step: default_step_budgets(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            master_secret_id: default_master_secret(),
            database: default_database(),
            users: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn max_retries_for(&self, step: Step) -> u32 {
        self.retry
            .per_step
            .get(&step)
            .copied()
            .unwrap_or(self.retry.max_retries)
    }

    pub fn budget_for(&self, step: Step) -> Duration {
        let secs = self
            .step_budgets
            .per_step
            .get(&step)
            .copied()
            .unwrap_or(self.step_budgets.default_secs);
        Duration::from_secs(secs)
    }
}
