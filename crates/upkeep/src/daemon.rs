//! Daemon composition: wires the store, API client, script runner,
//! control-map pool and signal port into the event loop, and exposes the
//! one-shot entry points the CLI uses.

use std::sync::mpsc;

use anyhow::{Context as _, Result};
use upkeep_store::FileStore;

use crate::api::DeviceApi;
use crate::config::Config;
use crate::controlmap::ControlMapPool;
use crate::handlers::{self, Context};
use crate::machine::{State, StateMachine};
use crate::scripts::ScriptRunner;
use crate::signals;
use crate::types::Reporter;

/// Exit code for a deployment that failed and could not be rolled back.
pub const EXIT_ROLLBACK_FAILED: i32 = 2;

struct Parts {
    store: FileStore,
    device_type: String,
}

fn open_parts(config: &Config) -> Result<Parts> {
    let store = FileStore::open(&config.store_dir()).context("failed to open the device store")?;
    let device_type = config.device_type()?;
    Ok(Parts { store, device_type })
}

fn build_context<'a>(
    config: &'a Config,
    store: &'a FileStore,
    device_type: String,
    reporter: &'a mut dyn Reporter,
    external: mpsc::Receiver<crate::machine::ExternalEvent>,
) -> Result<Context<'a>> {
    let api = DeviceApi::new(&config.server_url, config.http_timeout)?;
    let scripts = ScriptRunner::new(config.scripts.clone());
    let pool = ControlMapPool::load(store)?;
    Ok(Context::new(
        config,
        store,
        api,
        reporter,
        scripts,
        pool,
        device_type,
        external,
    ))
}

/// Run the daemon until a terminate signal. Returns the process exit
/// code.
pub fn run(config: &Config, reporter: &mut dyn Reporter) -> Result<i32> {
    config.validate()?;
    let parts = open_parts(config)?;

    let (tx, rx) = mpsc::channel();
    let _signals = signals::listen(tx)?;

    let mut ctx = build_context(config, &parts.store, parts.device_type, reporter, rx)?;
    let mut machine = StateMachine::new();
    machine.run(&mut ctx)?;

    Ok(if ctx.rollback_failed_seen {
        EXIT_ROLLBACK_FAILED
    } else {
        0
    })
}

/// One-shot: finish any interrupted deployment, then poll once and run
/// the resulting deployment to completion.
pub fn check_update(config: &Config, reporter: &mut dyn Reporter) -> Result<i32> {
    config.validate()?;
    let parts = open_parts(config)?;

    // No signal port in one-shot mode; the channel stays open so the
    // idle wait logic is never reached.
    let (_tx, rx) = mpsc::channel();
    let mut ctx = build_context(config, &parts.store, parts.device_type, reporter, rx)?;
    let mut machine = StateMachine::new();

    // Startup: script compatibility gate and journal recovery.
    handlers::handle_state(State::Init, &mut ctx)?;
    if let Some(resume) = ctx.take_resume() {
        machine.run_cycle(&mut ctx, resume)?;
    }

    machine.run_cycle(&mut ctx, State::SyncEnter)?;

    Ok(if ctx.rollback_failed_seen {
        EXIT_ROLLBACK_FAILED
    } else {
        0
    })
}

/// One-shot inventory submission.
pub fn send_inventory(config: &Config, reporter: &mut dyn Reporter) -> Result<i32> {
    config.validate()?;
    let parts = open_parts(config)?;

    let (_tx, rx) = mpsc::channel();
    let mut ctx = build_context(config, &parts.store, parts.device_type, reporter, rx)?;
    let mut machine = StateMachine::new();

    handlers::handle_state(State::Init, &mut ctx)?;
    machine.run_cycle(&mut ctx, State::SyncEnterInventory)?;
    Ok(0)
}
