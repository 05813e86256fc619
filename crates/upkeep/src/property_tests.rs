//! Property-based tests for client invariants.
//!
//! These cover the properties the design leans on:
//! - journal counter monotonicity across arbitrary write sequences
//! - loop termination within the store-count cap
//! - load→save idempotence (modulo the counter)
//! - wildcard matching used by provides erasure
//! - transition-table reachability of a single final status

use proptest::prelude::*;
use upkeep_store::MemStore;

use crate::journal::{self, MAX_STATE_DATA_STORE_COUNT, SaveOutcome};
use crate::machine::{Event, State, TransitionTable};
use crate::types::{Deployment, StateData, UpdateInfo, wildcard_match};

fn state_data(name: &str, count: u32) -> StateData {
    let mut info = UpdateInfo::new(Deployment {
        id: "d-prop".to_string(),
        artifact_name: "artifact-prop".to_string(),
        payload_types: vec!["rootfs-image".to_string()],
        ..Default::default()
    });
    info.state_data_store_count = count;
    StateData {
        version: journal::CURRENT_SCHEMA_VERSION,
        name: name.to_string(),
        update_info: info,
    }
}

fn journaled_state_name() -> impl Strategy<Value = String> {
    proptest::sample::select(vec![
        "update-store".to_string(),
        "update-install".to_string(),
        "reboot".to_string(),
        "verify-reboot".to_string(),
        "update-commit".to_string(),
        "update-after-first-commit".to_string(),
        "update-after-commit".to_string(),
        "rollback".to_string(),
        "rollback-reboot".to_string(),
        "verify-rollback-reboot".to_string(),
        "update-error".to_string(),
        "cleanup".to_string(),
    ])
}

proptest! {
    /// Counter monotonicity: across any sequence of writes, including
    /// reload-from-store cycles, the store count strictly increases.
    #[test]
    fn store_count_is_strictly_increasing(
        names in proptest::collection::vec(journaled_state_name(), 1..20),
        reload_every in 1usize..5,
    ) {
        let store = MemStore::new();
        let mut sd = state_data(&names[0], 0);
        let mut last = 0u32;

        for (i, name) in names.iter().enumerate() {
            if i % reload_every == 0
                && let Some(loaded) = journal::load(&store).expect("load")
            {
                sd = loaded;
            }
            sd.name = name.clone();
            let _ = journal::save(&store, &mut sd).expect("save");
            prop_assert!(sd.update_info.state_data_store_count > last);
            last = sd.update_info.state_data_store_count;
        }
    }

    /// Loop termination: from any starting count, the cap signal fires
    /// within MAX_STATE_DATA_STORE_COUNT + 1 writes.
    #[test]
    fn cap_fires_within_bound(start in 0u32..MAX_STATE_DATA_STORE_COUNT) {
        let store = MemStore::new();
        let mut sd = state_data("verify-reboot", start);
        let mut writes = 0;
        loop {
            writes += 1;
            match journal::save(&store, &mut sd).expect("save") {
                SaveOutcome::Saved => {
                    prop_assert!(writes <= MAX_STATE_DATA_STORE_COUNT + 1);
                }
                SaveOutcome::StoreCountExceeded => break,
            }
        }
        prop_assert!(writes as u32 <= MAX_STATE_DATA_STORE_COUNT + 1 - start.min(MAX_STATE_DATA_STORE_COUNT));
    }

    /// load → save leaves everything unchanged except the counter.
    #[test]
    fn load_save_idempotent_modulo_counter(name in journaled_state_name(), count in 0u32..20) {
        let store = MemStore::new();
        let mut sd = state_data(&name, count);
        journal::save(&store, &mut sd).expect("save");

        let mut first = journal::load(&store).expect("load").expect("present");
        let count_before = first.update_info.state_data_store_count;
        journal::save(&store, &mut first).expect("save");
        let second = journal::load(&store).expect("load").expect("present");

        prop_assert_eq!(second.name, first.name.clone());
        prop_assert_eq!(second.update_info.state_data_store_count, count_before + 1);
        prop_assert_eq!(
            serde_json::to_value(&second.update_info.deployment).expect("json"),
            serde_json::to_value(&first.update_info.deployment).expect("json")
        );
    }

    /// Resume-point selection is total: any persisted state name maps to
    /// a defined resume state.
    #[test]
    fn resume_point_is_total(name in "[a-z-]{0,30}") {
        let sd = state_data(&name, 3);
        let _ = journal::resume_point(&sd);
    }

    /// An exact pattern matches exactly itself.
    #[test]
    fn wildcard_exact_match(value in "[a-zA-Z0-9._-]{0,20}") {
        prop_assert!(wildcard_match(&value, &value));
    }

    /// A lone star matches anything.
    #[test]
    fn wildcard_star_matches_all(value in "[a-zA-Z0-9._-]{0,30}") {
        prop_assert!(wildcard_match("*", &value));
    }

    /// A prefix glob matches exactly the values with that prefix.
    #[test]
    fn wildcard_prefix_glob(prefix in "[a-z]{1,8}", rest in "[a-z0-9.]{0,12}") {
        let pattern = format!("{prefix}*");
        let matching = format!("{prefix}{rest}");
        prop_assert!(wildcard_match(&pattern, &matching));
        let unrelated = format!("x{matching}");
        prop_assert_eq!(wildcard_match(&pattern, &unrelated), unrelated.starts_with(&prefix));
    }
}

/// Every Failure edge in the table leads (via Success edges) to the
/// final-status report: the single-final-status invariant holds
/// structurally.
#[test]
fn every_failure_path_reaches_final_status() {
    let table = TransitionTable::new();

    let failure_sources: Vec<State> = table
        .rows()
        .filter(|((_, event), _)| *event == Event::Failure)
        .map(|(&(state, _), _)| state)
        .collect();

    for source in failure_sources {
        // Idle-loop states report nothing (their failure arcs return to
        // idle), and arcs downstream of the final report only finish the
        // teardown.
        let (mut cursor, _) = table.next(source, Event::Failure).expect("edge");
        if matches!(
            cursor,
            State::SyncError
                | State::IdleEnter
                | State::Idle
                | State::ClearArtifactData
                | State::EndOfDeployment
        ) {
            continue;
        }
        let mut hops = 0;
        while cursor != State::SendFinalStatus {
            // Prefer the pessimistic edge so the walk cannot cheat
            // through a success-only shortcut.
            let next = table
                .next(cursor, Event::NothingToDo)
                .or_else(|_| table.next(cursor, Event::Success))
                .unwrap_or_else(|_| panic!("dead end at {} from {}", cursor.name(), source.name()));
            cursor = next.0;
            hops += 1;
            assert!(
                hops < 20,
                "failure path from {} does not reach send-final-status",
                source.name()
            );
        }
    }
}
