//! Restore orchestration engine.
//!
//! Drives operations through the step graph:
//! - **Handlers**: one per step, no state writes
//! - **Poller**: turns provider statuses into recheck decisions
//! - **Runner**: leases, version-checked transitions, retries and the scheduler loop

pub mod backoff;
mod config;
pub mod graph;
mod handlers;
pub mod poller;
mod runner;
mod types;

pub use backoff::Backoff;
pub use config::{
    ArchiveFailurePolicy, OrchestratorConfig, PollConfig, ProvisioningConfig, RetryConfig,
    StepBudgets, UserGrant,
};
pub use handlers::{
    idempotency_token, keys, resolve_snapshot_id, summarize, Collaborators, StepContext,
    StepHandlers,
};
pub use poller::{PollDecision, ResourceKind, StatusPoller};
pub use runner::{RestoreOrchestrator, SETTINGS_ENV_PREFIX};
pub use types::{DriveOutcome, OrchestratorError, OrchestratorStatus, StepFailure, StepOutcome};
