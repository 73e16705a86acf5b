//! The fixed restore step graph.
//!
//! ```text
//! CHECK_SNAPSHOT -> COPY_SNAPSHOT -> CHECK_COPY_STATUS
//!     -> (target exists)  DELETE_TARGET_CLUSTER -> CHECK_DELETE_STATUS -> RESTORE_CLUSTER
//!     -> (no target)      RESTORE_CLUSTER
//! RESTORE_CLUSTER -> CHECK_RESTORE_STATUS -> PROVISION_USERS -> ARCHIVE_SNAPSHOT -> NOTIFY -> DONE
//! ```

use crate::operation::{Step, StepOutputs};

/// Every step the graph may move to from `step`.
pub fn successors(step: Step) -> &'static [Step] {
    match step {
        Step::CheckSnapshot => &[Step::CopySnapshot],
        Step::CopySnapshot => &[Step::CheckCopyStatus],
        Step::CheckCopyStatus => &[Step::DeleteTargetCluster, Step::RestoreCluster],
        Step::DeleteTargetCluster => &[Step::CheckDeleteStatus],
        Step::CheckDeleteStatus => &[Step::RestoreCluster],
        Step::RestoreCluster => &[Step::CheckRestoreStatus],
        Step::CheckRestoreStatus => &[Step::ProvisionUsers],
        Step::ProvisionUsers => &[Step::ArchiveSnapshot],
        Step::ArchiveSnapshot => &[Step::Notify],
        Step::Notify => &[Step::Done],
        Step::Done => &[],
    }
}

/// The step that follows `step`, given the outputs recorded so far.
///
/// The only conditional edge reads `copied_snapshot.target_exists`.
pub fn next_step(step: Step, outputs: &StepOutputs) -> Step {
    match step {
        Step::CheckCopyStatus => {
            let target_exists = outputs
                .copied_snapshot
                .as_ref()
                .is_some_and(|c| c.target_exists);
            if target_exists {
                Step::DeleteTargetCluster
            } else {
                Step::RestoreCluster
            }
        }
        Step::Done => Step::Done,
        other => successors(other)[0],
    }
}

pub fn is_valid_transition(from: Step, to: Step) -> bool {
    successors(from).contains(&to)
}

/// Whether `steps` is a walk of the graph from the first step, allowing
/// consecutive repeats of the same step.
pub fn is_valid_path(steps: &[Step]) -> bool {
    let mut deduped: Vec<Step> = steps.to_vec();
    deduped.dedup();

    match deduped.first() {
        None => true,
        Some(first) if *first != Step::CheckSnapshot => false,
        Some(_) => deduped
            .windows(2)
            .all(|pair| is_valid_transition(pair[0], pair[1])),
    }
}
