//! The main update state machine.
//!
//! The transition graph is data: a two-level lookup `(state, event) →
//! (next state, flag)` built once at startup and consulted per dispatch.
//! That keeps the graph auditable and lets tests enumerate it. State
//! behavior lives in [`crate::handlers`]; this module only routes.
//!
//! `Immediate` transitions fire within the handler's own continuation;
//! `Deferred` ones re-enter through the event loop, which is where
//! externally-posted signals are interleaved with internal progress.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::handlers::{self, Context};

/// All states of the machine. Names are the kebab-case forms used in
/// logs and, for the journaled subset, in the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Init,
    IdleEnter,
    Idle,
    SyncEnter,
    SyncError,
    PollForDeployment,
    SyncLeave,
    SyncLeaveDownload,
    SyncEnterInventory,
    SubmitInventory,
    SendDownloadStatus,
    DownloadEnter,
    UpdateFetch,
    UpdateStore,
    DownloadLeave,
    DownloadLeaveSaveProvides,
    DownloadError,
    UpdateRollbackNotNeeded,
    SendInstallStatus,
    InstallEnter,
    UpdateInstall,
    InstallLeave,
    InstallErrorRollback,
    CheckReboot,
    SendRebootStatus,
    RebootEnter,
    UpdateReboot,
    VerifyReboot,
    RebootLeave,
    RebootError,
    BeforeCommit,
    SendCommitStatus,
    CommitEnter,
    UpdateCommit,
    CommitError,
    UpdateAfterFirstCommit,
    CommitLeave,
    UpdateAfterCommit,
    UpdateSaveProvides,
    CheckRollback,
    RollbackEnter,
    UpdateRollback,
    RollbackLeave,
    CheckRollbackReboot,
    RollbackRebootEnter,
    UpdateRollbackReboot,
    VerifyRollbackReboot,
    RollbackRebootLeave,
    UpdateRollbackSuccessful,
    FailureEnter,
    UpdateFailure,
    FailureLeave,
    Cleanup,
    SendFinalStatus,
    ClearArtifactData,
    EndOfDeployment,
    StateLoop,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::IdleEnter => "idle-enter",
            State::Idle => "idle",
            State::SyncEnter => "sync-enter",
            State::SyncError => "sync-error",
            State::PollForDeployment => "poll-for-deployment",
            State::SyncLeave => "sync-leave",
            State::SyncLeaveDownload => "sync-leave-download",
            State::SyncEnterInventory => "sync-enter-inventory",
            State::SubmitInventory => "submit-inventory",
            State::SendDownloadStatus => "send-download-status",
            State::DownloadEnter => "download-enter",
            State::UpdateFetch => "update-fetch",
            State::UpdateStore => "update-store",
            State::DownloadLeave => "download-leave",
            State::DownloadLeaveSaveProvides => "download-leave-save-provides",
            State::DownloadError => "download-error",
            State::UpdateRollbackNotNeeded => "update-rollback-not-needed",
            State::SendInstallStatus => "send-install-status",
            State::InstallEnter => "install-enter",
            State::UpdateInstall => "update-install",
            State::InstallLeave => "install-leave",
            State::InstallErrorRollback => "install-error-rollback",
            State::CheckReboot => "check-reboot",
            State::SendRebootStatus => "send-reboot-status",
            State::RebootEnter => "reboot-enter",
            State::UpdateReboot => "reboot",
            State::VerifyReboot => "verify-reboot",
            State::RebootLeave => "reboot-leave",
            State::RebootError => "reboot-error",
            State::BeforeCommit => "before-commit",
            State::SendCommitStatus => "send-commit-status",
            State::CommitEnter => "commit-enter",
            State::UpdateCommit => "update-commit",
            State::CommitError => "commit-error",
            State::UpdateAfterFirstCommit => "update-after-first-commit",
            State::CommitLeave => "commit-leave",
            State::UpdateAfterCommit => "update-after-commit",
            State::UpdateSaveProvides => "update-save-provides",
            State::CheckRollback => "check-rollback",
            State::RollbackEnter => "rollback-enter",
            State::UpdateRollback => "rollback",
            State::RollbackLeave => "rollback-leave",
            State::CheckRollbackReboot => "check-rollback-reboot",
            State::RollbackRebootEnter => "rollback-reboot-enter",
            State::UpdateRollbackReboot => "rollback-reboot",
            State::VerifyRollbackReboot => "verify-rollback-reboot",
            State::RollbackRebootLeave => "rollback-reboot-leave",
            State::UpdateRollbackSuccessful => "update-rollback-successful",
            State::FailureEnter => "failure-enter",
            State::UpdateFailure => "update-error",
            State::FailureLeave => "failure-leave-save-provides",
            State::Cleanup => "cleanup",
            State::SendFinalStatus => "send-final-status",
            State::ClearArtifactData => "clear-artifact-data",
            State::EndOfDeployment => "end-of-deployment",
            State::StateLoop => "state-loop",
        }
    }
}

/// Events a handler can produce, plus the externally-posted triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    Success,
    Failure,
    NothingToDo,
    RebootRequired,
    RollbackSupported,
    Retry,
    StateLoopDetected,
    DeploymentFound,
    NoDeployment,
    DeploymentPollingTriggered,
    InventoryPollingTriggered,
    Terminate,
}

/// Whether a transition fires inside the current continuation or waits
/// for the event loop to drain externally-posted events first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionFlag {
    Immediate,
    Deferred,
}

/// Events the outside world can post into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEvent {
    PollTriggered,
    InventoryTriggered,
    Terminate,
}

/// The `(state, event) → (next, flag)` lookup.
pub struct TransitionTable {
    map: BTreeMap<(State, Event), (State, TransitionFlag)>,
}

impl TransitionTable {
    pub fn new() -> Self {
        use Event::*;
        use State::*;
        use TransitionFlag::*;

        let rows: &[(State, Event, State, TransitionFlag)] = &[
            // Idle / poll
            (Init, Success, IdleEnter, Immediate),
            (IdleEnter, Success, Idle, Deferred),
            (IdleEnter, Failure, Idle, Deferred),
            (Idle, DeploymentPollingTriggered, SyncEnter, Immediate),
            (Idle, InventoryPollingTriggered, SyncEnterInventory, Immediate),
            (SyncEnter, Success, PollForDeployment, Immediate),
            (SyncEnter, Failure, SyncError, Immediate),
            (SyncError, Success, IdleEnter, Deferred),
            (PollForDeployment, DeploymentFound, SyncLeaveDownload, Immediate),
            (PollForDeployment, NoDeployment, SyncLeave, Immediate),
            (PollForDeployment, Failure, SyncError, Immediate),
            (SyncLeave, Success, IdleEnter, Deferred),
            (SyncLeave, Failure, IdleEnter, Deferred),
            (SyncEnterInventory, Success, SubmitInventory, Immediate),
            (SyncEnterInventory, Failure, SyncError, Immediate),
            (SubmitInventory, Success, SyncLeave, Immediate),
            (SubmitInventory, Failure, SyncError, Immediate),
            // Download
            (SyncLeaveDownload, Success, SendDownloadStatus, Immediate),
            (SyncLeaveDownload, Failure, SendDownloadStatus, Immediate),
            (SendDownloadStatus, Success, DownloadEnter, Immediate),
            (SendDownloadStatus, Failure, DownloadError, Immediate),
            (DownloadEnter, Success, UpdateFetch, Immediate),
            (DownloadEnter, Failure, DownloadError, Immediate),
            (UpdateFetch, Success, UpdateStore, Immediate),
            (UpdateFetch, Failure, DownloadError, Immediate),
            (UpdateStore, Success, DownloadLeave, Immediate),
            (UpdateStore, NothingToDo, DownloadLeaveSaveProvides, Immediate),
            (UpdateStore, Failure, DownloadError, Immediate),
            (DownloadLeave, Success, SendInstallStatus, Immediate),
            (DownloadLeave, Failure, DownloadError, Immediate),
            (DownloadLeaveSaveProvides, Success, UpdateSaveProvides, Immediate),
            (DownloadError, Success, UpdateRollbackNotNeeded, Immediate),
            (UpdateRollbackNotNeeded, Success, Cleanup, Immediate),
            // Install
            (SendInstallStatus, Success, InstallEnter, Immediate),
            (SendInstallStatus, Failure, CheckRollback, Immediate),
            (InstallEnter, Success, UpdateInstall, Immediate),
            (InstallEnter, Failure, InstallErrorRollback, Immediate),
            (UpdateInstall, Success, InstallLeave, Immediate),
            (UpdateInstall, Failure, InstallErrorRollback, Immediate),
            (InstallLeave, Success, CheckReboot, Immediate),
            (InstallLeave, Failure, InstallErrorRollback, Immediate),
            (InstallErrorRollback, Success, CheckRollback, Immediate),
            // Reboot
            (CheckReboot, RebootRequired, SendRebootStatus, Immediate),
            (CheckReboot, NothingToDo, BeforeCommit, Immediate),
            (CheckReboot, Failure, InstallErrorRollback, Immediate),
            (SendRebootStatus, Success, RebootEnter, Immediate),
            (SendRebootStatus, Failure, CheckRollback, Immediate),
            (RebootEnter, Success, UpdateReboot, Immediate),
            (RebootEnter, Failure, RebootError, Immediate),
            (UpdateReboot, Success, VerifyReboot, Immediate),
            (UpdateReboot, Failure, RebootError, Immediate),
            (VerifyReboot, Success, RebootLeave, Immediate),
            (VerifyReboot, Failure, RebootError, Immediate),
            (RebootLeave, Success, BeforeCommit, Immediate),
            (RebootLeave, Failure, RebootError, Immediate),
            (RebootError, Success, CheckRollback, Immediate),
            // Commit
            (BeforeCommit, Success, SendCommitStatus, Immediate),
            (BeforeCommit, Failure, CheckRollback, Immediate),
            (SendCommitStatus, Success, CommitEnter, Immediate),
            (SendCommitStatus, Failure, CheckRollback, Immediate),
            (CommitEnter, Success, UpdateCommit, Immediate),
            (CommitEnter, Failure, CommitError, Immediate),
            (UpdateCommit, Success, UpdateAfterFirstCommit, Immediate),
            (UpdateCommit, Failure, CommitError, Immediate),
            (CommitError, Success, CheckRollback, Immediate),
            (UpdateAfterFirstCommit, Success, CommitLeave, Immediate),
            (CommitLeave, Success, UpdateAfterCommit, Immediate),
            (UpdateAfterCommit, Success, UpdateSaveProvides, Immediate),
            (UpdateSaveProvides, Success, Cleanup, Immediate),
            // Rollback
            (CheckRollback, RollbackSupported, RollbackEnter, Immediate),
            (CheckRollback, NothingToDo, FailureEnter, Immediate),
            (CheckRollback, Failure, FailureEnter, Immediate),
            (RollbackEnter, Success, UpdateRollback, Immediate),
            (RollbackEnter, Failure, FailureEnter, Immediate),
            (UpdateRollback, Success, RollbackLeave, Immediate),
            (UpdateRollback, Failure, FailureEnter, Immediate),
            (RollbackLeave, Success, CheckRollbackReboot, Immediate),
            (RollbackLeave, Failure, FailureEnter, Immediate),
            (CheckRollbackReboot, RebootRequired, RollbackRebootEnter, Immediate),
            (CheckRollbackReboot, NothingToDo, UpdateRollbackSuccessful, Immediate),
            (CheckRollbackReboot, Failure, FailureEnter, Immediate),
            (RollbackRebootEnter, Success, UpdateRollbackReboot, Immediate),
            (RollbackRebootEnter, Failure, FailureEnter, Immediate),
            // No Failure arc out of rollback-reboot: a failure there is
            // indistinguishable from a spontaneous reboot and is
            // rediscovered on the next startup.
            (UpdateRollbackReboot, Success, VerifyRollbackReboot, Immediate),
            (VerifyRollbackReboot, Success, RollbackRebootLeave, Immediate),
            (VerifyRollbackReboot, Retry, UpdateRollbackReboot, Immediate),
            (VerifyRollbackReboot, Failure, FailureEnter, Immediate),
            (RollbackRebootLeave, Success, UpdateRollbackSuccessful, Immediate),
            (RollbackRebootLeave, Failure, FailureEnter, Immediate),
            (UpdateRollbackSuccessful, Success, FailureEnter, Immediate),
            // Failure / cleanup
            (FailureEnter, Success, UpdateFailure, Immediate),
            (FailureEnter, Failure, UpdateFailure, Immediate),
            (UpdateFailure, Success, FailureLeave, Immediate),
            (UpdateFailure, Failure, FailureLeave, Immediate),
            (FailureLeave, Success, UpdateSaveProvides, Immediate),
            (FailureLeave, Failure, UpdateSaveProvides, Immediate),
            (Cleanup, Success, SendFinalStatus, Immediate),
            (Cleanup, Failure, SendFinalStatus, Immediate),
            (SendFinalStatus, Success, ClearArtifactData, Immediate),
            (SendFinalStatus, Failure, ClearArtifactData, Immediate),
            (ClearArtifactData, Success, EndOfDeployment, Immediate),
            (ClearArtifactData, Failure, EndOfDeployment, Immediate),
            (EndOfDeployment, Success, SubmitInventory, Immediate),
            (StateLoop, Success, SendFinalStatus, Immediate),
        ];

        let mut map = BTreeMap::new();
        for &(state, event, next, flag) in rows {
            map.insert((state, event), (next, flag));
        }
        Self { map }
    }

    /// Route one event. `StateLoopDetected` routes to the loop-break
    /// state from anywhere, bypassing rollback.
    pub fn next(&self, state: State, event: Event) -> Result<(State, TransitionFlag)> {
        if event == Event::StateLoopDetected {
            return Ok((State::StateLoop, TransitionFlag::Immediate));
        }
        match self.map.get(&(state, event)) {
            Some(&(next, flag)) => Ok((next, flag)),
            None => bail!(
                "no transition from {} on {event:?}",
                state.name()
            ),
        }
    }

    /// All rows, for audits and tests.
    pub fn rows(&self) -> impl Iterator<Item = (&(State, Event), &(State, TransitionFlag))> {
        self.map.iter()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminated,
}

pub struct StateMachine {
    current: State,
    table: TransitionTable,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: State::Init,
            table: TransitionTable::new(),
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Drive the machine until a terminate request. Handler errors are
    /// fatal-to-process and abort the loop.
    pub fn run(&mut self, ctx: &mut Context) -> Result<StopReason> {
        loop {
            // Terminate is honored after the current state's handler
            // returns; poll/inventory triggers are buffered and consumed
            // at deferred points (the idle state).
            if ctx.drain_external() {
                return Ok(StopReason::Terminated);
            }

            let event = handlers::handle_state(self.current, ctx)?;
            if event == Event::Terminate {
                return Ok(StopReason::Terminated);
            }

            ctx.observe(self.current, event);

            // Startup recovery jumps straight to the journaled resume
            // point instead of routing through the table.
            if let Some(resume) = ctx.take_resume() {
                self.current = resume;
                continue;
            }

            let (next, _flag) = self.table.next(self.current, event)?;
            self.current = next;
        }
    }

    /// Drive one cycle starting at `start`, stopping when the machine
    /// would re-enter idle. Used by the one-shot CLI commands.
    pub fn run_cycle(&mut self, ctx: &mut Context, start: State) -> Result<()> {
        self.current = start;
        loop {
            let event = handlers::handle_state(self.current, ctx)?;
            if event == Event::Terminate {
                return Ok(());
            }
            ctx.observe(self.current, event);
            if let Some(resume) = ctx.take_resume() {
                self.current = resume;
                continue;
            }
            let (next, _flag) = self.table.next(self.current, event)?;
            if matches!(next, State::IdleEnter | State::Idle) {
                return Ok(());
            }
            self.current = next;
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_loop_detected_routes_from_anywhere() {
        let table = TransitionTable::new();
        for state in [
            State::UpdateStore,
            State::UpdateInstall,
            State::VerifyRollbackReboot,
            State::UpdateAfterCommit,
            State::Idle,
        ] {
            let (next, flag) = table.next(state, Event::StateLoopDetected).expect("route");
            assert_eq!(next, State::StateLoop);
            assert_eq!(flag, TransitionFlag::Immediate);
        }
    }

    #[test]
    fn unknown_transition_is_an_error() {
        let table = TransitionTable::new();
        assert!(table.next(State::Idle, Event::Success).is_err());
    }

    #[test]
    fn commit_leave_goes_to_save_provides() {
        // Historical table bug: one revision had commit-leave fanning out
        // to a rollback check. The intended edge is save-provides.
        let table = TransitionTable::new();
        let (next, _) = table.next(State::CommitLeave, Event::Success).expect("route");
        assert_eq!(next, State::UpdateAfterCommit);
        let (next, _) = table
            .next(State::UpdateAfterCommit, Event::Success)
            .expect("route");
        assert_eq!(next, State::UpdateSaveProvides);
        assert!(table.next(State::CommitLeave, Event::Failure).is_err());
    }

    #[test]
    fn rollback_reboot_has_no_failure_arc() {
        let table = TransitionTable::new();
        assert!(table.next(State::UpdateRollbackReboot, Event::Success).is_ok());
        assert!(table.next(State::UpdateRollbackReboot, Event::Failure).is_err());
    }

    #[test]
    fn verify_rollback_reboot_retry_loops_back() {
        let table = TransitionTable::new();
        let (next, _) = table
            .next(State::VerifyRollbackReboot, Event::Retry)
            .expect("route");
        assert_eq!(next, State::UpdateRollbackReboot);
    }

    /// Every pre-commit state with a Failure arc must reach the rollback
    /// check (or the download error path, where nothing was installed).
    #[test]
    fn failure_arcs_upstream_of_commit_reach_rollback_check() {
        let table = TransitionTable::new();
        let upstream = [
            State::SendInstallStatus,
            State::InstallEnter,
            State::UpdateInstall,
            State::InstallLeave,
            State::CheckReboot,
            State::SendRebootStatus,
            State::RebootEnter,
            State::UpdateReboot,
            State::VerifyReboot,
            State::RebootLeave,
            State::BeforeCommit,
            State::SendCommitStatus,
            State::CommitEnter,
            State::UpdateCommit,
        ];

        for state in upstream {
            // Walk Success-free: follow the Failure edge, then Success
            // edges, until the rollback check shows up.
            let (mut cursor, _) = table.next(state, Event::Failure).expect("failure edge");
            let mut hops = 0;
            while cursor != State::CheckRollback {
                let (next, _) = table.next(cursor, Event::Success).expect("path to rollback");
                cursor = next;
                hops += 1;
                assert!(hops < 10, "no path from {} to check-rollback", state.name());
            }
        }

        // And from the check, rollback is reachable exactly when the
        // module supports it.
        let (next, _) = table
            .next(State::CheckRollback, Event::RollbackSupported)
            .expect("route");
        assert_eq!(next, State::RollbackEnter);
        let (next, _) = table
            .next(State::CheckRollback, Event::NothingToDo)
            .expect("route");
        assert_eq!(next, State::FailureEnter);
    }

    /// Download failures skip rollback entirely: nothing was installed.
    #[test]
    fn download_failures_do_not_roll_back() {
        let table = TransitionTable::new();
        for state in [
            State::SendDownloadStatus,
            State::DownloadEnter,
            State::UpdateFetch,
            State::UpdateStore,
            State::DownloadLeave,
        ] {
            let (next, _) = table.next(state, Event::Failure).expect("failure edge");
            assert_eq!(next, State::DownloadError, "from {}", state.name());
        }
        let (next, _) = table.next(State::DownloadError, Event::Success).expect("route");
        assert_eq!(next, State::UpdateRollbackNotNeeded);
        let (next, _) = table
            .next(State::UpdateRollbackNotNeeded, Event::Success)
            .expect("route");
        assert_eq!(next, State::Cleanup);
    }

    #[test]
    fn transitions_into_idle_are_deferred() {
        let table = TransitionTable::new();
        for (&(_state, _event), &(next, flag)) in table.rows() {
            if next == State::Idle || next == State::IdleEnter {
                assert_eq!(
                    flag,
                    TransitionFlag::Deferred,
                    "transition into {} must be deferred",
                    next.name()
                );
            } else {
                assert_eq!(flag, TransitionFlag::Immediate);
            }
        }
    }

    #[test]
    fn every_row_routes_to_a_live_state() {
        // The table must not reference states with no outgoing edges
        // other than the terminal loop (every state routes somewhere on
        // at least one event).
        let table = TransitionTable::new();
        for (&(_, _), &(next, _)) in table.rows() {
            if next == State::Idle {
                continue;
            }
            let has_outgoing = table.rows().any(|(&(s, _), _)| s == next);
            assert!(has_outgoing, "{} has no outgoing edges", next.name());
        }
    }
}
