//! Per-state behavior of the update machine.
//!
//! Each state's handler performs its side effects (journal write, state
//! scripts, update-module invocation, server report) and produces the
//! event the transition table routes on. Handlers returning `Err` abort
//! the event loop: that is the fatal-to-process class (store failures,
//! broken configuration). Everything deployment-scoped becomes a
//! `Failure` event instead and travels through the graph.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Instant;

use anyhow::{Context as _, Result};
use upkeep_retry::{RetryExecutor, calculate_delay};
use upkeep_store::Store;

use crate::api::{DeviceApi, PollOutcome, ReportError};
use crate::config::Config;
use crate::controlmap::ControlMapPool;
use crate::deploylog::DeploymentLog;
use crate::download::fetch_artifact;
use crate::journal::{self, ResumeState, SaveOutcome};
use crate::machine::{Event, ExternalEvent, State};
use crate::module::{ModuleError, ModuleRunner, ModuleState, PayloadFile};
use crate::scripts::{Phase, ScriptRunner};
use crate::tracker::{DeploymentTracker, TrackerEvent};
use crate::types::{
    Deployment, DeploymentStatus, ErrorClass, RebootRequest, Reporter, StateData, UpdateInfo,
    wildcard_match,
};

/// The deployment currently owned by the machine.
pub struct ActiveDeployment {
    pub state_data: StateData,
    pub log: DeploymentLog,
    /// Set once the module's `ArtifactCommit` succeeded (or the artifact
    /// had nothing to install and its provides apply as-is).
    pub committed: bool,
    /// Post-commit leave failure or loop break: the artifact name gets
    /// the INCONSISTENT suffix at the provides commit.
    pub inconsistent: bool,
    /// One in-place retry of the rollback-reboot verification per
    /// journal slot.
    pub rollback_reboot_retried: bool,
    pub final_status: Option<DeploymentStatus>,
}

impl ActiveDeployment {
    fn id(&self) -> &str {
        &self.state_data.update_info.deployment.id
    }
}

/// Everything the handlers work against.
pub struct Context<'a> {
    pub config: &'a Config,
    pub store: &'a dyn Store,
    pub api: DeviceApi,
    pub reporter: &'a mut dyn Reporter,
    pub scripts: ScriptRunner,
    pub tracker: DeploymentTracker,
    pub pool: ControlMapPool,
    pub device_type: String,
    pub deployment: Option<ActiveDeployment>,
    /// Sticky record of a rollback that did not complete cleanly; the
    /// process exit code reflects it in one-shot mode.
    pub rollback_failed_seen: bool,
    external: Receiver<ExternalEvent>,
    pending_poll: bool,
    pending_inventory: bool,
    next_poll_at: Instant,
    next_inventory_at: Instant,
    resume_to: Option<State>,
}

impl<'a> Context<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a Config,
        store: &'a dyn Store,
        api: DeviceApi,
        reporter: &'a mut dyn Reporter,
        scripts: ScriptRunner,
        pool: ControlMapPool,
        device_type: String,
        external: Receiver<ExternalEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            store,
            api,
            reporter,
            scripts,
            tracker: DeploymentTracker::new(),
            pool,
            device_type,
            deployment: None,
            rollback_failed_seen: false,
            external,
            pending_poll: false,
            pending_inventory: false,
            next_poll_at: now + config.update_poll_interval,
            next_inventory_at: now + config.inventory_poll_interval,
            resume_to: None,
        }
    }

    /// Scan the external queue. Returns true on a terminate request;
    /// poll/inventory triggers are buffered for the idle state.
    pub(crate) fn drain_external(&mut self) -> bool {
        loop {
            match self.external.try_recv() {
                Ok(ExternalEvent::Terminate) => return true,
                Ok(ExternalEvent::PollTriggered) => self.pending_poll = true,
                Ok(ExternalEvent::InventoryTriggered) => self.pending_inventory = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    pub(crate) fn take_resume(&mut self) -> Option<State> {
        self.resume_to.take()
    }

    /// Tracker wiring, applied on every dispatched event.
    pub(crate) fn observe(&mut self, _state: State, event: Event) {
        match event {
            Event::Failure | Event::StateLoopDetected => {
                if self.deployment.is_some() {
                    self.tracker.handle(TrackerEvent::Failure);
                }
            }
            Event::RollbackSupported => self.tracker.handle(TrackerEvent::RollbackStarted),
            _ => {}
        }
    }

    /// Log to the deployment log (when one is open) and the reporter.
    fn log(&mut self, level: &str, msg: &str) {
        match level {
            "ERROR" => self.reporter.error(msg),
            "WARN" => self.reporter.warn(msg),
            _ => self.reporter.info(msg),
        }
        if let Some(deployment) = &self.deployment
            && let Err(e) = deployment.log.append(level, msg)
        {
            self.reporter.warn(&format!("failed to append deployment log: {e:#}"));
        }
    }

    /// Journal the given state. A store-count overflow becomes the
    /// loop-break event; a store failure is retried locally and only
    /// becomes fatal-to-process after all retries.
    fn journal_as(&mut self, state: State) -> Result<Option<Event>> {
        let retry = self.config.retry.resolve();
        let store = self.store;
        let Some(deployment) = self.deployment.as_mut() else {
            return Ok(None);
        };
        deployment.state_data.name = state.name().to_string();

        // Every save bumps the store count, so each retry attempt starts
        // from the same base; a flaky disk must not burn the loop cap.
        let base_count = deployment.state_data.update_info.state_data_store_count;
        let state_data = &mut deployment.state_data;
        let outcome = RetryExecutor::new(retry)
            .run(|_attempt| {
                state_data.update_info.state_data_store_count = base_count;
                journal::save(store, state_data)
            })
            .context("journal write failed after retries")?;

        match outcome {
            SaveOutcome::Saved => Ok(None),
            SaveOutcome::StoreCountExceeded => {
                self.log(
                    "ERROR",
                    &format!(
                        "journal store count exceeded at {}; breaking the deployment loop",
                        state.name()
                    ),
                );
                Ok(Some(Event::StateLoopDetected))
            }
        }
    }

    /// Report `failure` for the active deployment; the API layer makes
    /// this at-most-once per deployment id. Reporting problems never
    /// change routing here.
    fn report_failure_once(&mut self) {
        let Some(deployment) = &self.deployment else {
            return;
        };
        let id = deployment.id().to_string();
        match self.api.report_status(&id, DeploymentStatus::Failure, None) {
            Ok(()) => {}
            Err(ReportError::Aborted) => {
                self.log("WARN", "server aborted the deployment while reporting failure");
            }
            Err(ReportError::Transient(e)) => {
                self.log("WARN", &format!("failure report not delivered: {e:#}"));
            }
        }
    }

    /// Send a progress status with local retries. `Ok(true)` means
    /// continue; `Ok(false)` means the server aborted the deployment.
    fn report_progress(&mut self, status: DeploymentStatus) -> bool {
        let Some(deployment) = &self.deployment else {
            return true;
        };
        let id = deployment.id().to_string();
        let retry = self.config.retry.resolve();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.report_status(&id, status, None) {
                Ok(()) => return true,
                Err(ReportError::Aborted) => {
                    self.log("ERROR", "deployment aborted by the server");
                    return false;
                }
                Err(ReportError::Transient(e)) => {
                    if attempt >= retry.max_attempts {
                        // Reporting failures are ignorable; the update
                        // itself must not stall on a flaky link.
                        self.log(
                            "WARN",
                            &format!("giving up on {status} report after {attempt} attempts: {e:#}"),
                        );
                        return true;
                    }
                    let delay = calculate_delay(&retry, attempt);
                    self.log(
                        "WARN",
                        &format!("{status} report failed ({e:#}); retrying in {}",
                            humantime::format_duration(delay)),
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    fn begin_deployment(&mut self, deployment: Deployment) -> Result<()> {
        let log = DeploymentLog::open(&self.config.log_dir(), &deployment.id)?;
        self.deployment = Some(ActiveDeployment {
            state_data: StateData {
                version: journal::CURRENT_SCHEMA_VERSION,
                name: String::new(),
                update_info: UpdateInfo::new(deployment),
            },
            log,
            committed: false,
            inconsistent: false,
            rollback_reboot_retried: false,
            final_status: None,
        });
        self.tracker.handle(TrackerEvent::DeploymentStarted);
        Ok(())
    }

    /// Rebuild the in-memory deployment from a recovered journal record
    /// and jump the machine to the resume point.
    pub fn resume_deployment(&mut self, state_data: StateData) -> Result<()> {
        let (resume, seed) = journal::resume_point(&state_data);
        let log = DeploymentLog::open(&self.config.log_dir(), &state_data.update_info.deployment.id)?;

        let resume_state = match resume {
            ResumeState::VerifyReboot => State::VerifyReboot,
            ResumeState::VerifyRollbackReboot => State::VerifyRollbackReboot,
            ResumeState::RollbackEnter => State::RollbackEnter,
            ResumeState::UpdateAfterCommit => State::UpdateAfterCommit,
            ResumeState::FailureEnter => State::FailureEnter,
            ResumeState::Cleanup => State::Cleanup,
            ResumeState::CheckRollback => State::CheckRollback,
        };

        self.deployment = Some(ActiveDeployment {
            committed: resume_state == State::UpdateAfterCommit,
            inconsistent: false,
            rollback_reboot_retried: false,
            final_status: None,
            log,
            state_data,
        });
        self.tracker = DeploymentTracker::seeded(seed);
        self.resume_to = Some(resume_state);
        Ok(())
    }

    fn payload_path(&self) -> PathBuf {
        self.config.work_dir().join("payload")
    }

    fn module_tree(&self) -> PathBuf {
        self.config.work_dir().join("tree")
    }

    fn module_runner(&self) -> Result<ModuleRunner, ModuleError> {
        let deployment = self
            .deployment
            .as_ref()
            .ok_or_else(|| ModuleError::Other(anyhow::anyhow!("no active deployment")))?;
        let payload_type = deployment
            .state_data
            .update_info
            .payload_type()
            .ok_or_else(|| ModuleError::Other(anyhow::anyhow!("deployment has no payload type")))?;
        ModuleRunner::new(
            &self.config.module_dir,
            payload_type,
            self.module_tree(),
            self.config.module_timeout,
        )
    }

    /// Run an update-module state, mapping every failure kind onto the
    /// machine's Failure arc while logging the specific cause.
    fn module_call(&mut self, state: ModuleState) -> Event {
        let runner = match self.module_runner() {
            Ok(runner) => runner,
            Err(e) => {
                self.log("ERROR", &format!("update module unavailable: {e}"));
                return Event::Failure;
            }
        };
        match runner.call(state, self.reporter) {
            Ok(()) => Event::Success,
            Err(e) => {
                self.log(
                    "ERROR",
                    &format!("{} failed ({}): {e}", state.as_arg(), e.class()),
                );
                Event::Failure
            }
        }
    }

    fn update_info(&self) -> Option<&UpdateInfo> {
        self.deployment.as_ref().map(|d| &d.state_data.update_info)
    }
}

/// Dispatch one state. Returns the event that drives the next
/// transition.
pub(crate) fn handle_state(state: State, ctx: &mut Context) -> Result<Event> {
    match state {
        State::Init => init(ctx),
        State::IdleEnter => {
            ctx.scripts.run_best_effort("Idle", Phase::Enter, ctx.reporter);
            Ok(Event::Success)
        }
        State::Idle => idle(ctx),
        State::SyncEnter | State::SyncEnterInventory => {
            Ok(run_scripts(ctx, "Sync", Phase::Enter))
        }
        State::SyncError => {
            ctx.scripts.run_best_effort("Sync", Phase::Error, ctx.reporter);
            Ok(Event::Success)
        }
        State::PollForDeployment => poll_for_deployment(ctx),
        State::SyncLeave => {
            ctx.scripts.run_best_effort("Sync", Phase::Leave, ctx.reporter);
            Ok(Event::Success)
        }
        State::SyncLeaveDownload => {
            ctx.scripts.run_best_effort("Sync", Phase::Leave, ctx.reporter);
            Ok(Event::Success)
        }
        State::SubmitInventory => submit_inventory(ctx),
        State::SendDownloadStatus => Ok(send_progress(ctx, DeploymentStatus::Downloading)),
        State::DownloadEnter => {
            // A partial payload left behind by an abandoned deployment
            // must not be range-resumed into; every deployment starts
            // its fetch clean.
            let _ = std::fs::remove_file(ctx.payload_path());
            Ok(run_scripts(ctx, "Download", Phase::Enter))
        }
        State::UpdateFetch => update_fetch(ctx),
        State::UpdateStore => update_store(ctx),
        State::DownloadLeave => Ok(run_scripts(ctx, "Download", Phase::Leave)),
        State::DownloadLeaveSaveProvides => {
            ctx.scripts.run_best_effort("Download", Phase::Leave, ctx.reporter);
            // Nothing to install: the artifact's provides apply as-is.
            if let Some(d) = ctx.deployment.as_mut() {
                d.committed = true;
            }
            Ok(Event::Success)
        }
        State::DownloadError => {
            ctx.scripts.run_best_effort("Download", Phase::Error, ctx.reporter);
            ctx.report_failure_once();
            Ok(Event::Success)
        }
        State::UpdateRollbackNotNeeded => {
            if let Some(d) = ctx.deployment.as_mut() {
                d.state_data.update_info.all_rollbacks_successful = true;
            }
            Ok(Event::Success)
        }
        State::SendInstallStatus => Ok(send_progress(ctx, DeploymentStatus::Installing)),
        State::InstallEnter => Ok(run_scripts(ctx, "ArtifactInstall", Phase::Enter)),
        State::UpdateInstall => {
            if let Some(event) = ctx.journal_as(State::UpdateInstall)? {
                return Ok(event);
            }
            Ok(ctx.module_call(ModuleState::ArtifactInstall))
        }
        State::InstallLeave => Ok(run_scripts(ctx, "ArtifactInstall", Phase::Leave)),
        State::InstallErrorRollback => {
            ctx.scripts.run_best_effort("ArtifactInstall", Phase::Error, ctx.reporter);
            ctx.report_failure_once();
            Ok(Event::Success)
        }
        State::CheckReboot => check_reboot(ctx),
        State::SendRebootStatus => Ok(send_progress(ctx, DeploymentStatus::Rebooting)),
        State::RebootEnter => Ok(run_scripts(ctx, "ArtifactReboot", Phase::Enter)),
        State::UpdateReboot => {
            if let Some(event) = ctx.journal_as(State::UpdateReboot)? {
                return Ok(event);
            }
            Ok(ctx.module_call(ModuleState::ArtifactReboot))
        }
        State::VerifyReboot => {
            if let Some(event) = ctx.journal_as(State::VerifyReboot)? {
                return Ok(event);
            }
            Ok(ctx.module_call(ModuleState::ArtifactVerifyReboot))
        }
        State::RebootLeave => Ok(run_scripts(ctx, "ArtifactReboot", Phase::Leave)),
        State::RebootError => {
            ctx.scripts.run_best_effort("ArtifactReboot", Phase::Error, ctx.reporter);
            ctx.report_failure_once();
            Ok(Event::Success)
        }
        State::BeforeCommit => before_commit(ctx),
        State::SendCommitStatus => {
            // The commit phase reports "rebooting" only when the payload
            // actually rebooted; otherwise it is still "installing" and
            // the progress dedup keeps it off the wire.
            let rebooted = ctx
                .update_info()
                .and_then(|info| info.reboot_requested.first().copied())
                .map(|r| r != RebootRequest::None)
                .unwrap_or(false);
            let status = if rebooted {
                DeploymentStatus::Rebooting
            } else {
                DeploymentStatus::Installing
            };
            Ok(send_progress(ctx, status))
        }
        State::CommitEnter => Ok(run_scripts(ctx, "ArtifactCommit", Phase::Enter)),
        State::UpdateCommit => update_commit(ctx),
        State::CommitError => {
            ctx.scripts.run_best_effort("ArtifactCommit", Phase::Error, ctx.reporter);
            ctx.report_failure_once();
            Ok(Event::Success)
        }
        State::UpdateAfterFirstCommit => {
            if let Some(event) = ctx.journal_as(State::UpdateAfterFirstCommit)? {
                return Ok(event);
            }
            Ok(Event::Success)
        }
        State::CommitLeave => commit_leave(ctx),
        State::UpdateAfterCommit => {
            if let Some(event) = ctx.journal_as(State::UpdateAfterCommit)? {
                return Ok(event);
            }
            Ok(Event::Success)
        }
        State::UpdateSaveProvides => update_save_provides(ctx),
        State::CheckRollback => check_rollback(ctx),
        State::RollbackEnter => Ok(run_scripts(ctx, "ArtifactRollback", Phase::Enter)),
        State::UpdateRollback => {
            if let Some(event) = ctx.journal_as(State::UpdateRollback)? {
                return Ok(event);
            }
            Ok(ctx.module_call(ModuleState::ArtifactRollback))
        }
        State::RollbackLeave => Ok(run_scripts(ctx, "ArtifactRollback", Phase::Leave)),
        State::CheckRollbackReboot => check_rollback_reboot(ctx),
        State::RollbackRebootEnter => Ok(run_scripts(ctx, "ArtifactRollbackReboot", Phase::Enter)),
        State::UpdateRollbackReboot => {
            if let Some(event) = ctx.journal_as(State::UpdateRollbackReboot)? {
                return Ok(event);
            }
            if let Some(d) = ctx.deployment.as_mut() {
                d.rollback_reboot_retried = false;
            }
            // No Failure arc here: an error is indistinguishable from
            // the reboot actually happening, so log and move on to
            // verification.
            if let Event::Failure = ctx.module_call(ModuleState::ArtifactRollbackReboot) {
                ctx.log("WARN", "rollback reboot module call failed; verifying anyway");
            }
            Ok(Event::Success)
        }
        State::VerifyRollbackReboot => verify_rollback_reboot(ctx),
        State::RollbackRebootLeave => Ok(run_scripts(ctx, "ArtifactRollbackReboot", Phase::Leave)),
        State::UpdateRollbackSuccessful => {
            if let Some(d) = ctx.deployment.as_mut() {
                d.state_data.update_info.all_rollbacks_successful = true;
            }
            Ok(Event::Success)
        }
        State::FailureEnter => {
            ctx.report_failure_once();
            Ok(run_scripts(ctx, "ArtifactFailure", Phase::Enter))
        }
        State::UpdateFailure => {
            if let Some(event) = ctx.journal_as(State::UpdateFailure)? {
                return Ok(event);
            }
            if let Event::Failure = ctx.module_call(ModuleState::ArtifactFailure) {
                ctx.log("WARN", "ArtifactFailure module call failed (ignored)");
            }
            Ok(Event::Success)
        }
        State::FailureLeave => {
            ctx.scripts.run_best_effort("ArtifactFailure", Phase::Leave, ctx.reporter);
            Ok(Event::Success)
        }
        State::Cleanup => cleanup(ctx),
        State::SendFinalStatus => send_final_status(ctx),
        State::ClearArtifactData => clear_artifact_data(ctx),
        State::EndOfDeployment => {
            if let Some(d) = &ctx.deployment {
                let id = d.id().to_string();
                ctx.api.end_deployment(&id);
            }
            if ctx.tracker.rollback_failed() {
                ctx.rollback_failed_seen = true;
            }
            ctx.tracker.handle(TrackerEvent::DeploymentEnded);
            ctx.deployment = None;
            Ok(Event::Success)
        }
        State::StateLoop => state_loop(ctx),
    }
}

fn run_scripts(ctx: &mut Context, state: &str, phase: Phase) -> Event {
    match ctx.scripts.run(state, phase, ctx.reporter) {
        Ok(()) => Event::Success,
        Err(e) => {
            ctx.log("ERROR", &format!("{state}_{} scripts failed: {e:#}", phase.as_str()));
            Event::Failure
        }
    }
}

fn send_progress(ctx: &mut Context, status: DeploymentStatus) -> Event {
    if ctx.report_progress(status) {
        Event::Success
    } else {
        Event::Failure
    }
}

fn init(ctx: &mut Context) -> Result<Event> {
    // Incompatible rootfs scripts are fatal before any deployment is
    // accepted.
    ctx.scripts.check_version()?;

    if ctx.store.read(journal::KEY_STANDALONE_STATE)?.is_some() {
        ctx.reporter.warn(
            "standalone install in progress; leaving its journal alone and starting idle",
        );
        return Ok(Event::Success);
    }

    match journal::load(ctx.store) {
        Ok(None) => Ok(Event::Success),
        Ok(Some(state_data)) => {
            ctx.reporter.info(&format!(
                "recovered deployment {} interrupted in state {}",
                state_data.update_info.deployment.id, state_data.name
            ));
            ctx.resume_deployment(state_data)?;
            Ok(Event::Success)
        }
        Err(e) if e.class() == ErrorClass::FatalProcess => {
            ctx.reporter
                .error(&format!("journal unusable ({}): {e}", e.class()));
            Err(e.into())
        }
        Err(e) => {
            // Schema newer than this binary with no readable fallback:
            // the recorded deployment cannot be resumed, but the device
            // must keep updating. Quarantine the record and start idle.
            ctx.reporter.error(&format!(
                "journal unusable ({}): {e}; abandoning the recorded deployment",
                e.class()
            ));
            journal::clear(ctx.store)?;
            Ok(Event::Success)
        }
    }
}

fn idle(ctx: &mut Context) -> Result<Event> {
    loop {
        if ctx.pending_poll {
            ctx.pending_poll = false;
            ctx.next_poll_at = Instant::now() + ctx.config.update_poll_interval;
            return Ok(Event::DeploymentPollingTriggered);
        }
        if ctx.pending_inventory {
            ctx.pending_inventory = false;
            ctx.next_inventory_at = Instant::now() + ctx.config.inventory_poll_interval;
            return Ok(Event::InventoryPollingTriggered);
        }

        let now = Instant::now();
        if now >= ctx.next_poll_at {
            ctx.next_poll_at = now + ctx.config.update_poll_interval;
            return Ok(Event::DeploymentPollingTriggered);
        }
        if now >= ctx.next_inventory_at {
            ctx.next_inventory_at = now + ctx.config.inventory_poll_interval;
            return Ok(Event::InventoryPollingTriggered);
        }

        let wait = ctx.next_poll_at.min(ctx.next_inventory_at) - now;
        match ctx.external.recv_timeout(wait) {
            Ok(ExternalEvent::Terminate) => return Ok(Event::Terminate),
            Ok(ExternalEvent::PollTriggered) => ctx.pending_poll = true,
            Ok(ExternalEvent::InventoryTriggered) => ctx.pending_inventory = true,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
        }
    }
}

fn poll_for_deployment(ctx: &mut Context) -> Result<Event> {
    let provides = journal::read_provides(ctx.store)?;

    let polled = match ctx.api.poll_deployment(&provides, &ctx.device_type) {
        Ok(PollOutcome::NoDeployment) => return Ok(Event::NoDeployment),
        Ok(PollOutcome::Deployment(polled)) => *polled,
        Err(e) => {
            ctx.reporter.warn(&format!("deployment poll failed: {e:#}"));
            return Ok(Event::Failure);
        }
    };
    let deployment = polled.deployment;

    // Control-map edge rules: inherit a missing id, treat a mismatched
    // one as a transient poll error (after telling the server), purge
    // the pool when the response carries no map at all.
    match polled.control_map {
        Some(mut map) => {
            match &map.id {
                None => map.id = Some(deployment.id.clone()),
                Some(map_id) if *map_id != deployment.id => {
                    ctx.reporter.error(&format!(
                        "control map id {map_id} does not match deployment {}",
                        deployment.id
                    ));
                    let _ = ctx
                        .api
                        .report_status(&deployment.id, DeploymentStatus::Failure, None);
                    return Ok(Event::Failure);
                }
                Some(_) => {}
            }
            ctx.pool.insert_replace_all_priorities(map)?;
            ctx.pool.save(ctx.store)?;
        }
        None => {
            ctx.pool.delete_all_priorities(&deployment.id);
            ctx.pool.save(ctx.store)?;
        }
    }

    // Already installed: report once, no journal entry, stay idle.
    if journal::installed_artifact_name(ctx.store)?.as_deref()
        == Some(deployment.artifact_name.as_str())
    {
        ctx.reporter.info(&format!(
            "artifact {} is already installed",
            deployment.artifact_name
        ));
        match ctx
            .api
            .report_status(&deployment.id, DeploymentStatus::AlreadyInstalled, None)
        {
            Ok(()) => {}
            Err(e) => ctx
                .reporter
                .warn(&format!("already-installed report not delivered: {e}")),
        }
        return Ok(Event::NoDeployment);
    }

    // Compatibility and dependency checks run before any side effect.
    if !deployment.device_types_compatible.is_empty()
        && !deployment
            .device_types_compatible
            .iter()
            .any(|d| d == &ctx.device_type)
    {
        ctx.reporter.error(&format!(
            "artifact {} is not compatible with device type {}",
            deployment.artifact_name, ctx.device_type
        ));
        let _ = ctx
            .api
            .report_status(&deployment.id, DeploymentStatus::Failure, None);
        return Ok(Event::Failure);
    }

    for (key, wanted) in &deployment.artifact_depends {
        let satisfied = provides
            .get(key)
            .map(|have| wildcard_match(wanted, have))
            .unwrap_or(false);
        if !satisfied {
            ctx.reporter.error(&format!(
                "artifact {} depends on {key}={wanted}, device provides {:?}",
                deployment.artifact_name,
                provides.get(key)
            ));
            let _ = ctx
                .api
                .report_status(&deployment.id, DeploymentStatus::Failure, None);
            return Ok(Event::Failure);
        }
    }

    ctx.reporter.info(&format!(
        "accepted deployment {} (artifact {})",
        deployment.id, deployment.artifact_name
    ));
    ctx.begin_deployment(deployment)?;
    Ok(Event::DeploymentFound)
}

fn submit_inventory(ctx: &mut Context) -> Result<Event> {
    let attributes = match crate::inventory::collect(
        &ctx.config.inventory_scripts_dir,
        ctx.store,
        &ctx.device_type,
        ctx.reporter,
    ) {
        Ok(attributes) => attributes,
        Err(e) => {
            ctx.reporter.warn(&format!("inventory collection failed: {e:#}"));
            return Ok(Event::Failure);
        }
    };
    match ctx.api.submit_inventory(&attributes) {
        Ok(true) => ctx.reporter.info("inventory submitted"),
        Ok(false) => ctx.reporter.info("inventory unchanged; submission skipped"),
        Err(e) => {
            ctx.reporter.warn(&format!("inventory submission failed: {e:#}"));
            return Ok(Event::Failure);
        }
    }
    Ok(Event::Success)
}

fn update_fetch(ctx: &mut Context) -> Result<Event> {
    let Some(info) = ctx.update_info() else {
        return Ok(Event::Failure);
    };
    if info.deployment.payload_types.is_empty() {
        // Metadata-only artifact: nothing to fetch.
        return Ok(Event::Success);
    }
    let source = info.deployment.source.clone();
    let dest = ctx.payload_path();
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let retry = ctx.config.retry.resolve();
    let http = ctx.api.http().clone();
    match fetch_artifact(&http, &source, &dest, &retry, ctx.reporter) {
        Ok(size) => {
            ctx.log("INFO", &format!("fetched artifact ({size} bytes)"));
            Ok(Event::Success)
        }
        Err(e) => {
            ctx.log("ERROR", &format!("artifact fetch failed: {e:#}"));
            Ok(Event::Failure)
        }
    }
}

fn update_store(ctx: &mut Context) -> Result<Event> {
    if let Some(event) = ctx.journal_as(State::UpdateStore)? {
        return Ok(event);
    }

    let Some(info) = ctx.update_info().cloned() else {
        return Ok(Event::Failure);
    };

    // An artifact whose download produced no payload skips install,
    // commit and every reboot state.
    let payload = ctx.payload_path();
    let empty = info.deployment.payload_types.is_empty()
        || payload.metadata().map(|m| m.len() == 0).unwrap_or(true);
    if empty {
        ctx.log("INFO", "empty payload; nothing to install");
        return Ok(Event::NothingToDo);
    }

    let artifact_name = info.deployment.artifact_name.clone();

    let runner = match ctx.module_runner() {
        Ok(runner) => runner,
        Err(e) => {
            ctx.log("ERROR", &format!("update module unavailable: {e}"));
            return Ok(Event::Failure);
        }
    };

    let current_name =
        journal::installed_artifact_name(ctx.store)?.unwrap_or_else(|| "unknown".to_string());
    let current_group = journal::installed_artifact_group(ctx.store)?.unwrap_or_default();

    let result = runner
        .prepare_tree(&info, &ctx.device_type, &current_name, &current_group)
        .and_then(|()| {
            runner.download(
                &[PayloadFile {
                    name: artifact_name,
                    path: payload,
                }],
                ctx.reporter,
            )
        });

    match result {
        Ok(()) => Ok(Event::Success),
        Err(e) => {
            ctx.log("ERROR", &format!("payload handover failed: {e}"));
            Ok(Event::Failure)
        }
    }
}

fn check_reboot(ctx: &mut Context) -> Result<Event> {
    let runner = match ctx.module_runner() {
        Ok(runner) => runner,
        Err(e) => {
            ctx.log("ERROR", &format!("update module unavailable: {e}"));
            return Ok(Event::Failure);
        }
    };
    match runner.needs_reboot(ctx.reporter) {
        Ok(request) => {
            if let Some(d) = ctx.deployment.as_mut() {
                d.state_data.update_info.reboot_requested = vec![request];
            }
            match request {
                RebootRequest::None => Ok(Event::NothingToDo),
                RebootRequest::Custom | RebootRequest::Automatic => Ok(Event::RebootRequired),
            }
        }
        Err(e) => {
            ctx.log("ERROR", &format!("NeedsArtifactReboot failed: {e}"));
            Ok(Event::Failure)
        }
    }
}

fn before_commit(ctx: &mut Context) -> Result<Event> {
    let Some(deployment) = &ctx.deployment else {
        return Ok(Event::Failure);
    };
    // Server-issued control maps gate the commit edge.
    if let Some(action) = ctx.pool.action_for(deployment.id(), "ArtifactCommit_Enter")
        && action == "fail"
    {
        ctx.log("ERROR", "control map forbids commit");
        return Ok(Event::Failure);
    }
    Ok(Event::Success)
}

fn update_commit(ctx: &mut Context) -> Result<Event> {
    if let Some(event) = ctx.journal_as(State::UpdateCommit)? {
        return Ok(event);
    }
    match ctx.module_call(ModuleState::ArtifactCommit) {
        Event::Success => {
            if let Some(d) = ctx.deployment.as_mut() {
                d.committed = true;
            }
            Ok(Event::Success)
        }
        event => Ok(event),
    }
}

fn commit_leave(ctx: &mut Context) -> Result<Event> {
    // A leave failure after commit never aborts progress; the deployment
    // continues with the INCONSISTENT mark.
    if let Err(e) = ctx.scripts.run("ArtifactCommit", Phase::Leave, ctx.reporter) {
        ctx.log(
            "ERROR",
            &format!("ArtifactCommit_Leave failed after commit; marking inconsistent: {e:#}"),
        );
        if let Some(d) = ctx.deployment.as_mut() {
            d.inconsistent = true;
        }
    }
    Ok(Event::Success)
}

fn update_save_provides(ctx: &mut Context) -> Result<Event> {
    let Some(deployment) = &ctx.deployment else {
        return Ok(Event::Success);
    };
    if deployment.committed {
        let info = deployment.state_data.update_info.clone();
        let inconsistent = deployment.inconsistent;
        journal::commit_provides_and_clear(ctx.store, &info, inconsistent)?;
        ctx.log("INFO", "provides committed");
    }
    Ok(Event::Success)
}

fn check_rollback(ctx: &mut Context) -> Result<Event> {
    let runner = match ctx.module_runner() {
        Ok(runner) => runner,
        Err(e) => {
            ctx.log("ERROR", &format!("update module unavailable: {e}"));
            return Ok(Event::Failure);
        }
    };
    match runner.supports_rollback(ctx.reporter) {
        Ok(supported) => {
            if let Some(d) = ctx.deployment.as_mut() {
                d.state_data.update_info.supports_rollback = if supported {
                    crate::types::RollbackSupport::Supported
                } else {
                    crate::types::RollbackSupport::NotSupported
                };
            }
            if supported {
                Ok(Event::RollbackSupported)
            } else {
                Ok(Event::NothingToDo)
            }
        }
        Err(e) => {
            ctx.log("ERROR", &format!("SupportsRollback failed: {e}"));
            Ok(Event::Failure)
        }
    }
}

fn check_rollback_reboot(ctx: &mut Context) -> Result<Event> {
    let request = ctx
        .update_info()
        .and_then(|info| info.reboot_requested.first().copied())
        .unwrap_or(RebootRequest::None);
    match request {
        RebootRequest::None => Ok(Event::NothingToDo),
        RebootRequest::Custom | RebootRequest::Automatic => Ok(Event::RebootRequired),
    }
}

fn verify_rollback_reboot(ctx: &mut Context) -> Result<Event> {
    if let Some(event) = ctx.journal_as(State::VerifyRollbackReboot)? {
        return Ok(event);
    }
    match ctx.module_call(ModuleState::ArtifactVerifyRollbackReboot) {
        Event::Success => Ok(Event::Success),
        _ => {
            let retried = ctx
                .deployment
                .as_ref()
                .map(|d| d.rollback_reboot_retried)
                .unwrap_or(true);
            if retried {
                return Ok(Event::Failure);
            }
            if let Some(d) = ctx.deployment.as_mut() {
                d.rollback_reboot_retried = true;
            }
            let retry = ctx.config.retry.resolve();
            let delay = calculate_delay(&retry, 1);
            ctx.log(
                "WARN",
                &format!(
                    "rollback reboot verification failed; retrying once in {}",
                    humantime::format_duration(delay)
                ),
            );
            std::thread::sleep(delay);
            Ok(Event::Retry)
        }
    }
}

fn cleanup(ctx: &mut Context) -> Result<Event> {
    let committed = ctx
        .deployment
        .as_ref()
        .map(|d| d.committed)
        .unwrap_or(false);
    // Success-path journals were already cleared by the provides
    // transaction; re-journaling here would turn a crash after a good
    // commit into a reported failure.
    if !committed
        && let Some(event) = ctx.journal_as(State::Cleanup)?
    {
        return Ok(event);
    }

    if ctx.update_info().and_then(|i| i.payload_type().map(str::to_string)).is_some()
        && ctx.module_tree().exists()
        && let Ok(runner) = ctx.module_runner()
        && let Err(e) = runner.call(ModuleState::Cleanup, ctx.reporter)
    {
        ctx.log("WARN", &format!("module Cleanup failed (ignored): {e}"));
    }
    Ok(Event::Success)
}

fn send_final_status(ctx: &mut Context) -> Result<Event> {
    let Some(deployment) = &ctx.deployment else {
        return Ok(Event::Success);
    };
    let id = deployment.id().to_string();
    let status = deployment
        .final_status
        .unwrap_or_else(|| ctx.tracker.final_status());

    // Upload the deployment log first so a failing deployment arrives
    // with its evidence attached.
    if status == DeploymentStatus::Failure
        && let Some(d) = &ctx.deployment
    {
        match d.log.read_for_upload() {
            Ok(entries) if !entries.is_empty() => {
                if let Err(e) = ctx.api.upload_log(&id, &entries) {
                    ctx.reporter.warn(&format!("deployment log upload failed: {e:#}"));
                }
            }
            Ok(_) => {}
            Err(e) => ctx.reporter.warn(&format!("deployment log unreadable: {e:#}")),
        }
    }

    match ctx.api.report_status(&id, status, None) {
        Ok(()) => ctx.reporter.info(&format!("final status for {id}: {status}")),
        Err(ReportError::Aborted) => {
            ctx.reporter.warn("server aborted deployment at final report");
        }
        Err(ReportError::Transient(e)) => {
            ctx.reporter.warn(&format!("final status report failed: {e:#}"));
        }
    }
    Ok(Event::Success)
}

fn clear_artifact_data(ctx: &mut Context) -> Result<Event> {
    journal::clear(ctx.store)?;
    if let Some(deployment) = &ctx.deployment {
        ctx.pool.delete_all_priorities(deployment.id());
        ctx.pool.save(ctx.store)?;
        if let Err(e) = deployment.log.remove() {
            ctx.reporter.warn(&format!("failed to remove deployment log: {e:#}"));
        }
    }
    let work = ctx.config.work_dir();
    if work.exists()
        && let Err(e) = std::fs::remove_dir_all(&work)
    {
        ctx.reporter.warn(&format!("failed to clear work dir: {e:#}"));
    }
    Ok(Event::Success)
}

fn state_loop(ctx: &mut Context) -> Result<Event> {
    ctx.report_failure_once();
    if let Some(deployment) = ctx.deployment.as_mut() {
        deployment.final_status = Some(DeploymentStatus::Failure);
    }
    // Only a committed deployment mutates provides here; the marker
    // makes inventory surface the broken install on the next cycle.
    let committed = ctx
        .deployment
        .as_ref()
        .map(|d| d.committed)
        .unwrap_or(false);
    if committed
        && let Some(deployment) = &ctx.deployment
    {
        let info = deployment.state_data.update_info.clone();
        journal::commit_provides_and_clear(ctx.store, &info, true)?;
    }
    Ok(Event::Success)
}
