//! Status polling of asynchronous provider operations.
//!
//! The poller never sleeps. It turns one observed provider status into a
//! decision; waiting is the orchestrator's job (persisted `next_run_at`).

use std::time::Duration;

use tracing::warn;

use crate::resource::RemoteStatus;

use super::backoff::Backoff;
use super::config::PollConfig;
use super::types::StepFailure;

/// Which asynchronous operation a status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    SnapshotCopy,
    ClusterDeletion,
    ClusterRestore,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::SnapshotCopy => "snapshot_copy",
            ResourceKind::ClusterDeletion => "cluster_deletion",
            ResourceKind::ClusterRestore => "cluster_restore",
        }
    }

    fn vocabulary(&self) -> (&'static [&'static str], &'static [&'static str]) {
        // (succeeded, failed); anything else counts as still running.
        match self {
            ResourceKind::SnapshotCopy => (
                &["available", "completed", "succeeded"],
                &["failed", "error", "deleted", "incompatible-parameters", "cancelled"],
            ),
            ResourceKind::ClusterDeletion => (
                &["deleted", "completed", "succeeded"],
                &["failed", "error", "delete-failed", "deletion-protected"],
            ),
            ResourceKind::ClusterRestore => (
                &["available", "completed", "succeeded"],
                &[
                    "failed",
                    "error",
                    "inaccessible-encryption-credentials",
                    "incompatible-network",
                    "incompatible-parameters",
                    "incompatible-restore",
                    "storage-full",
                ],
            ),
        }
    }
}

const RUNNING: &[&str] = &[
    "pending",
    "queued",
    "creating",
    "copying",
    "deleting",
    "restoring",
    "modifying",
    "backing-up",
    "rebooting",
    "configuring",
    "in-progress",
    "in_progress",
    "running",
];

/// Provider status mapped onto the poller's three states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Running,
    Succeeded,
    Failed,
}

/// Classify a provider status string. Unknown statuses keep polling.
pub fn classify(kind: ResourceKind, status: &str) -> PollState {
    let status = status.trim().to_ascii_lowercase();
    let (succeeded, failed) = kind.vocabulary();

    if succeeded.contains(&status.as_str()) {
        PollState::Succeeded
    } else if failed.contains(&status.as_str()) {
        PollState::Failed
    } else {
        if !RUNNING.contains(&status.as_str()) {
            warn!(kind = kind.as_str(), status = %status, "Unrecognised provider status, treating as running");
        }
        PollState::Running
    }
}

/// What to do after observing one status.
#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    /// The operation finished successfully.
    Complete(RemoteStatus),
    /// Check again after `delay`.
    Recheck { delay: Duration, attempt: u32 },
    Fail(StepFailure),
}

#[derive(Debug, Clone)]
pub struct StatusPoller {
    backoff: Backoff,
    max_attempts: u32,
}

impl StatusPoller {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            backoff: Backoff::from_millis(config.base_interval_ms, config.max_interval_ms),
            max_attempts: config.max_poll_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Decide on the `attempt`-th observation (1-based) of an operation.
    pub fn evaluate(&self, kind: ResourceKind, attempt: u32, status: RemoteStatus) -> PollDecision {
        match classify(kind, &status.status) {
            PollState::Succeeded => PollDecision::Complete(status),
            PollState::Failed => {
                let detail = status
                    .detail
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default();
                PollDecision::Fail(StepFailure::provider_failure(format!(
                    "{} reported status {}{}",
                    kind.as_str(),
                    status.status,
                    detail
                )))
            }
            PollState::Running if attempt >= self.max_attempts => {
                PollDecision::Fail(StepFailure::poll_exhausted(format!(
                    "{} still {} after {} polls",
                    kind.as_str(),
                    status.status,
                    attempt
                )))
            }
            PollState::Running => PollDecision::Recheck {
                delay: self.backoff.delay(attempt),
                attempt,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ErrorKind;

    fn poller(max_attempts: u32) -> StatusPoller {
        StatusPoller::new(&PollConfig {
            base_interval_ms: 1000,
            max_interval_ms: 4000,
            max_poll_attempts: max_attempts,
        })
    }

    #[test]
    fn test_classify_vocabularies() {
        assert_eq!(classify(ResourceKind::SnapshotCopy, "copying"), PollState::Running);
        assert_eq!(classify(ResourceKind::SnapshotCopy, "AVAILABLE"), PollState::Succeeded);
        assert_eq!(classify(ResourceKind::ClusterDeletion, "deleted"), PollState::Succeeded);
        assert_eq!(classify(ResourceKind::SnapshotCopy, "deleted"), PollState::Failed);
        assert_eq!(
            classify(ResourceKind::ClusterRestore, "incompatible-network"),
            PollState::Failed
        );
        assert_eq!(classify(ResourceKind::ClusterRestore, "weird-new-state"), PollState::Running);
    }

    #[test]
    fn test_running_schedules_growing_rechecks() {
        let poller = poller(10);
        let delays: Vec<Duration> = (1..=4)
            .map(|attempt| {
                match poller.evaluate(ResourceKind::SnapshotCopy, attempt, RemoteStatus::new("copying")) {
                    PollDecision::Recheck { delay, .. } => delay,
                    other => panic!("unexpected {:?}", other),
                }
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(4000),
            ]
        );
    }

    #[test]
    fn test_exhaustion_is_distinct_from_provider_failure() {
        let poller = poller(3);
        let exhausted = poller.evaluate(ResourceKind::ClusterRestore, 3, RemoteStatus::new("creating"));
        assert!(matches!(exhausted, PollDecision::Fail(ref f) if f.kind == ErrorKind::PollExhausted));

        let mut failed_status = RemoteStatus::new("storage-full");
        failed_status.detail = Some("no space".to_string());
        let failed = poller.evaluate(ResourceKind::ClusterRestore, 1, failed_status);
        match failed {
            PollDecision::Fail(f) => {
                assert_eq!(f.kind, ErrorKind::ProviderFailure);
                assert!(f.message.contains("no space"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_success_on_last_allowed_attempt() {
        let poller = poller(3);
        let decision = poller.evaluate(ResourceKind::SnapshotCopy, 3, RemoteStatus::new("available"));
        assert!(matches!(decision, PollDecision::Complete(_)));
    }
}
