//! Deployment tracker: a second, tiny state machine whose only job is to
//! decide the final status reported to the server. `success` is reachable
//! only through a deployment that never saw a failure; everything else
//! terminates as `failure`.

use serde::{Deserialize, Serialize};

use crate::journal::TrackerSeed;
use crate::types::DeploymentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    #[default]
    Idle,
    NoFailures,
    Failure,
    RollbackAttempted,
    RollbackFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    DeploymentStarted,
    Failure,
    RollbackStarted,
    DeploymentEnded,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentTracker {
    state: TrackerState,
}

impl DeploymentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker from a journal resume branch.
    pub fn seeded(seed: TrackerSeed) -> Self {
        let state = match seed {
            TrackerSeed::NoFailures => TrackerState::NoFailures,
            TrackerSeed::Failure => TrackerState::Failure,
            TrackerSeed::RollbackAttempted => TrackerState::RollbackAttempted,
        };
        Self { state }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn handle(&mut self, event: TrackerEvent) {
        self.state = match (self.state, event) {
            (TrackerState::Idle, TrackerEvent::DeploymentStarted) => TrackerState::NoFailures,

            (TrackerState::NoFailures, TrackerEvent::Failure) => TrackerState::Failure,
            (TrackerState::Failure, TrackerEvent::RollbackStarted) => {
                TrackerState::RollbackAttempted
            }
            // A failure while rolling back means the device may be in
            // neither the old nor the new state.
            (TrackerState::RollbackAttempted, TrackerEvent::Failure) => {
                TrackerState::RollbackFailed
            }

            (_, TrackerEvent::DeploymentEnded) => TrackerState::Idle,

            // Everything else keeps the current branch: a second failure
            // in the failure branch carries no new information.
            (state, _) => state,
        };
    }

    /// The status to report when the deployment terminates. Must be read
    /// before `DeploymentEnded` resets the tracker.
    pub fn final_status(&self) -> DeploymentStatus {
        match self.state {
            TrackerState::NoFailures => DeploymentStatus::Success,
            _ => DeploymentStatus::Failure,
        }
    }

    /// True when a rollback was attempted but did not complete cleanly.
    pub fn rollback_failed(&self) -> bool {
        self.state == TrackerState::RollbackFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_deployment_reports_success() {
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        assert_eq!(tracker.final_status(), DeploymentStatus::Success);
        tracker.handle(TrackerEvent::DeploymentEnded);
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn any_failure_reports_failure() {
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        tracker.handle(TrackerEvent::Failure);
        assert_eq!(tracker.final_status(), DeploymentStatus::Failure);
    }

    #[test]
    fn rollback_path_is_still_failure() {
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        tracker.handle(TrackerEvent::Failure);
        tracker.handle(TrackerEvent::RollbackStarted);
        assert_eq!(tracker.state(), TrackerState::RollbackAttempted);
        assert_eq!(tracker.final_status(), DeploymentStatus::Failure);
        assert!(!tracker.rollback_failed());
    }

    #[test]
    fn failure_during_rollback_is_rollback_failed() {
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        tracker.handle(TrackerEvent::Failure);
        tracker.handle(TrackerEvent::RollbackStarted);
        tracker.handle(TrackerEvent::Failure);
        assert_eq!(tracker.state(), TrackerState::RollbackFailed);
        assert!(tracker.rollback_failed());
    }

    #[test]
    fn repeated_failures_do_not_change_branch() {
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        tracker.handle(TrackerEvent::Failure);
        tracker.handle(TrackerEvent::Failure);
        assert_eq!(tracker.state(), TrackerState::Failure);
    }

    #[test]
    fn seeding_matches_resume_branches() {
        assert_eq!(
            DeploymentTracker::seeded(TrackerSeed::NoFailures).state(),
            TrackerState::NoFailures
        );
        assert_eq!(
            DeploymentTracker::seeded(TrackerSeed::RollbackAttempted).state(),
            TrackerState::RollbackAttempted
        );
    }

    #[test]
    fn rollback_started_from_no_failures_is_ignored() {
        // RollbackStarted only makes sense after a failure; a spurious
        // event must not fabricate a rollback branch.
        let mut tracker = DeploymentTracker::new();
        tracker.handle(TrackerEvent::DeploymentStarted);
        tracker.handle(TrackerEvent::RollbackStarted);
        assert_eq!(tracker.state(), TrackerState::NoFailures);
    }
}
