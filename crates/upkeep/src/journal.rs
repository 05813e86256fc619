//! Deployment journal: durable `StateData` with crash recovery.
//!
//! The journal owns four store keys. `state_data` is the committed slot:
//! absent, or a fully valid record of the current schema. During a schema
//! upgrade records go to `state_data_uncommitted` instead, so a downgrade
//! to the previous binary still finds a readable committed slot. Every
//! write increments `state_data_store_count`; crossing the cap is how the
//! client breaks crash-install-crash loops.

use std::collections::BTreeMap;

use anyhow::Context;
use thiserror::Error;
use upkeep_store::Store;

use crate::types::{
    INCONSISTENT_SUFFIX, RebootRequest, RollbackSupport, StateData, UpdateInfo, wildcard_match,
};

/// Committed journal slot.
pub const KEY_STATE_DATA: &str = "state_data";
/// Slot used while a schema migration is in flight.
pub const KEY_STATE_DATA_UNCOMMITTED: &str = "state_data_uncommitted";
/// Name of the currently installed artifact.
pub const KEY_ARTIFACT_NAME: &str = "artifact-name";
/// Group of the currently installed artifact.
pub const KEY_ARTIFACT_GROUP: &str = "artifact-group";
/// Free-form provides map, JSON object.
pub const KEY_ARTIFACT_PROVIDES: &str = "artifact-provides";
/// Marker owned by one-shot (standalone) installs; the daemon must not
/// resume a deployment while it is present.
pub const KEY_STANDALONE_STATE: &str = "standalone-state";

/// Current journal schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Hard cap on journal writes per deployment.
pub const MAX_STATE_DATA_STORE_COUNT: u32 = 28;

/// Payload type assumed for records written before payload types existed.
const LEGACY_PAYLOAD_TYPE: &str = "rootfs-image";

/// What a journal write reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The write completed, but the store count crossed the cap; the
    /// machine must route to the loop-break state.
    StoreCountExceeded,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal schema version {found} is newer than this client supports ({supported}); uncommitted fallback also unusable: {detail}")]
    SchemaTooNew {
        found: u32,
        supported: u32,
        detail: String,
    },
    #[error("journal data is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl JournalError {
    /// A too-new schema ends the deployment (we are a downgraded
    /// binary); anything else means storage itself cannot be trusted.
    pub fn class(&self) -> crate::types::ErrorClass {
        match self {
            JournalError::SchemaTooNew { .. } => crate::types::ErrorClass::FatalDeployment,
            _ => crate::types::ErrorClass::FatalProcess,
        }
    }
}

/// Persist `state_data`, bumping the store count first.
///
/// With `has_db_schema_update` set the record goes to the uncommitted
/// slot and the committed slot is left alone; otherwise the committed
/// slot is written and the uncommitted slot removed in the same
/// transaction.
pub fn save(store: &dyn Store, state_data: &mut StateData) -> Result<SaveOutcome, JournalError> {
    state_data.version = CURRENT_SCHEMA_VERSION;
    state_data.update_info.state_data_store_count += 1;

    let bytes = serde_json::to_vec(state_data)
        .context("failed to serialize state data")
        .map_err(JournalError::Store)?;

    if state_data.update_info.has_db_schema_update {
        store.write(KEY_STATE_DATA_UNCOMMITTED, &bytes)?;
    } else {
        store.write_transaction(&mut |txn| {
            txn.write(KEY_STATE_DATA, &bytes)?;
            txn.remove(KEY_STATE_DATA_UNCOMMITTED)
        })?;
    }

    if state_data.update_info.state_data_store_count > MAX_STATE_DATA_STORE_COUNT {
        Ok(SaveOutcome::StoreCountExceeded)
    } else {
        Ok(SaveOutcome::Saved)
    }
}

/// Load the journal on startup. `Ok(None)` means no recovery is needed.
pub fn load(store: &dyn Store) -> Result<Option<StateData>, JournalError> {
    let Some(committed) = store.read(KEY_STATE_DATA)? else {
        return Ok(None);
    };

    let value: serde_json::Value = serde_json::from_slice(&committed)
        .map_err(|e| JournalError::Corrupt(format!("committed slot is not JSON: {e}")))?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    if version == CURRENT_SCHEMA_VERSION {
        let sd: StateData = serde_json::from_value(value)
            .map_err(|e| JournalError::Corrupt(format!("committed slot: {e}")))?;
        return Ok(Some(sd));
    }

    if version < CURRENT_SCHEMA_VERSION {
        let mut sd: StateData = serde_json::from_value(value)
            .map_err(|e| JournalError::Corrupt(format!("committed slot (schema v{version}): {e}")))?;

        // An uncommitted record with the same deployment id is the
        // in-progress migration of this very record; prefer it.
        if let Some(uncommitted) = store.read(KEY_STATE_DATA_UNCOMMITTED)?
            && let Ok(mut newer) = serde_json::from_slice::<StateData>(&uncommitted)
            && newer.update_info.deployment.id == sd.update_info.deployment.id
        {
            newer.update_info.has_db_schema_update = true;
            return Ok(Some(newer));
        }

        synthesize_legacy_fields(&mut sd.update_info);
        return Ok(Some(sd));
    }

    // Schema is newer than this binary: we are rolling back to an older
    // client. The uncommitted slot holds the pre-upgrade record.
    match store.read(KEY_STATE_DATA_UNCOMMITTED)? {
        Some(uncommitted) => match serde_json::from_slice::<StateData>(&uncommitted) {
            Ok(sd) => Ok(Some(sd)),
            Err(e) => Err(JournalError::SchemaTooNew {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
                detail: e.to_string(),
            }),
        },
        None => Err(JournalError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
            detail: "uncommitted slot is absent".to_string(),
        }),
    }
}

/// Defaults that are legal only for pre-v2 records.
fn synthesize_legacy_fields(info: &mut UpdateInfo) {
    if info.deployment.payload_types.is_empty() {
        info.deployment.payload_types.push(LEGACY_PAYLOAD_TYPE.to_string());
    }
    if info.reboot_requested.is_empty() {
        info.reboot_requested.push(RebootRequest::Custom);
    }
    if info.supports_rollback == RollbackSupport::Unknown {
        info.supports_rollback = RollbackSupport::Supported;
    }
}

/// Remove both journal slots. Provides are untouched.
pub fn clear(store: &dyn Store) -> Result<(), JournalError> {
    store.write_transaction(&mut |txn| {
        txn.remove(KEY_STATE_DATA)?;
        txn.remove(KEY_STATE_DATA_UNCOMMITTED)
    })?;
    Ok(())
}

/// Name of the currently installed artifact, if any.
pub fn installed_artifact_name(store: &dyn Store) -> Result<Option<String>, JournalError> {
    read_string(store, KEY_ARTIFACT_NAME)
}

/// Group of the currently installed artifact, if any.
pub fn installed_artifact_group(store: &dyn Store) -> Result<Option<String>, JournalError> {
    read_string(store, KEY_ARTIFACT_GROUP)
}

fn read_string(store: &dyn Store, key: &str) -> Result<Option<String>, JournalError> {
    match store.read(key)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| JournalError::Corrupt(format!("{key} is not UTF-8"))),
    }
}

/// Full provides snapshot: `artifact_name`, `artifact_group`, and the
/// free-form pairs. Used for the poll body and dependency checks.
pub fn read_provides(store: &dyn Store) -> Result<BTreeMap<String, String>, JournalError> {
    let mut provides = free_form_provides(store)?;
    if let Some(name) = installed_artifact_name(store)? {
        provides.insert("artifact_name".to_string(), name);
    }
    if let Some(group) = installed_artifact_group(store)? {
        provides.insert("artifact_group".to_string(), group);
    }
    Ok(provides)
}

fn free_form_provides(store: &dyn Store) -> Result<BTreeMap<String, String>, JournalError> {
    match store.read(KEY_ARTIFACT_PROVIDES)? {
        None => Ok(BTreeMap::new()),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| JournalError::Corrupt(format!("artifact-provides: {e}"))),
    }
}

/// The successful-commit boundary: publish the new provides, erase the
/// cleared ones, and remove the journal entry — one transaction, so
/// either all of it is visible after a crash or none of it.
///
/// With `inconsistent` set the artifact name is written with the
/// INCONSISTENT suffix (post-commit leave failure, loop break after
/// commit).
pub fn commit_provides_and_clear(
    store: &dyn Store,
    info: &UpdateInfo,
    inconsistent: bool,
) -> Result<(), JournalError> {
    let mut free_form = free_form_provides(store)?;
    let deployment = &info.deployment;

    for pattern in &deployment.clears_artifact_provides {
        free_form.retain(|key, _| !wildcard_match(pattern, key));
    }
    for (key, value) in &deployment.type_info_provides {
        free_form.insert(key.clone(), value.clone());
    }

    let mut name = deployment.artifact_name.clone();
    if inconsistent {
        name.push_str(INCONSISTENT_SUFFIX);
    }

    let clear_group = deployment
        .clears_artifact_provides
        .iter()
        .any(|p| wildcard_match(p, "artifact_group"));

    let free_form_bytes = serde_json::to_vec(&free_form)
        .context("failed to serialize artifact provides")
        .map_err(JournalError::Store)?;

    store.write_transaction(&mut |txn| {
        txn.write(KEY_ARTIFACT_NAME, name.as_bytes())?;
        match &deployment.artifact_group {
            Some(group) => txn.write(KEY_ARTIFACT_GROUP, group.as_bytes())?,
            None if clear_group => txn.remove(KEY_ARTIFACT_GROUP)?,
            None => {}
        }
        txn.write(KEY_ARTIFACT_PROVIDES, &free_form_bytes)?;
        txn.remove(KEY_STATE_DATA)?;
        txn.remove(KEY_STATE_DATA_UNCOMMITTED)
    })?;
    Ok(())
}

/// Resume points the startup loader can place the machine into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    VerifyReboot,
    VerifyRollbackReboot,
    RollbackEnter,
    UpdateAfterCommit,
    FailureEnter,
    Cleanup,
    CheckRollback,
}

/// Seed for the deployment tracker when resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerSeed {
    NoFailures,
    Failure,
    RollbackAttempted,
}

/// Map a recovered record to the state the machine resumes in, and the
/// tracker branch that decides the final reported status. Unknown state
/// names fall back to a rollback check as the safety default.
pub fn resume_point(state_data: &StateData) -> (ResumeState, TrackerSeed) {
    let rollback_flag = if state_data.update_info.all_rollbacks_successful {
        TrackerSeed::RollbackAttempted
    } else {
        TrackerSeed::Failure
    };

    match state_data.name.as_str() {
        "update-store" => (ResumeState::Cleanup, TrackerSeed::RollbackAttempted),
        "reboot" | "verify-reboot" => (ResumeState::VerifyReboot, TrackerSeed::NoFailures),
        "rollback" => (ResumeState::RollbackEnter, TrackerSeed::RollbackAttempted),
        "rollback-reboot" | "verify-rollback-reboot" => {
            (ResumeState::VerifyRollbackReboot, TrackerSeed::RollbackAttempted)
        }
        "update-after-commit" | "update-after-first-commit" => {
            (ResumeState::UpdateAfterCommit, TrackerSeed::NoFailures)
        }
        "update-error" => (ResumeState::FailureEnter, rollback_flag),
        "cleanup" => (ResumeState::Cleanup, rollback_flag),
        _ => (ResumeState::CheckRollback, TrackerSeed::Failure),
    }
}
