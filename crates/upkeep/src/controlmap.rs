//! Pool of server-issued update-control maps.
//!
//! Maps arrive with deployment polls and gate how far the server wants an
//! update to proceed. The pool keeps them per deployment id, sorted by
//! priority (higher first), and expires them on two clocks: a boot-life
//! window measured from when this process learned about the map, and an
//! absolute wall-clock expiry.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use upkeep_store::Store;

/// Store key the pool persists under.
pub const KEY_UPDATE_CONTROL_MAPS: &str = "update_control_maps";

/// A server-issued update-control map, as received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMap {
    /// Deployment id. May be absent on the wire; the poll edge fills it
    /// in from the deployment before insertion.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Per-state policies, opaque to the pool.
    #[serde(default)]
    pub states: BTreeMap<String, serde_json::Value>,
    /// Absolute lifetime in seconds.
    #[serde(default = "default_expiration_seconds")]
    pub expiration_seconds: u64,
    /// Lifetime within the current boot, in seconds.
    #[serde(default = "default_boot_expiration_seconds")]
    pub boot_expiration_seconds: u64,
}

fn default_expiration_seconds() -> u64 {
    300
}

fn default_boot_expiration_seconds() -> u64 {
    600
}

/// A map plus the instant the pool learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StampedMap {
    map: ControlMap,
    inserted_at: DateTime<Utc>,
    /// Reset to load time when the pool is read back after a reboot.
    #[serde(skip, default = "Utc::now")]
    seen_this_boot: DateTime<Utc>,
}

impl StampedMap {
    fn active(&self, now: DateTime<Utc>) -> bool {
        let absolute =
            self.inserted_at + ChronoDuration::seconds(self.map.expiration_seconds as i64);
        let boot =
            self.seen_this_boot + ChronoDuration::seconds(self.map.boot_expiration_seconds as i64);
        now < absolute && now < boot
    }
}

/// Priority-queued set of control maps keyed by deployment id.
#[derive(Debug, Default)]
pub struct ControlMapPool {
    maps: BTreeMap<String, Vec<StampedMap>>,
}

impl ControlMapPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a map, replacing every existing map with the same id
    /// regardless of priority. The map must carry its id by now.
    pub fn insert_replace_all_priorities(&mut self, map: ControlMap) -> Result<()> {
        let id = map
            .id
            .clone()
            .context("control map has no deployment id")?;
        let now = Utc::now();
        let entry = StampedMap {
            map,
            inserted_at: now,
            seen_this_boot: now,
        };
        self.maps.insert(id, vec![entry]);
        self.sort();
        Ok(())
    }

    /// Remove every map for `id`.
    pub fn delete_all_priorities(&mut self, id: &str) {
        self.maps.remove(id);
    }

    /// Active maps for `id`, highest priority first. Expired maps are
    /// filtered, not deleted; deletion happens on the next insert/purge.
    pub fn get(&self, id: &str) -> Vec<&ControlMap> {
        let now = Utc::now();
        let Some(entries) = self.maps.get(id) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| e.active(now))
            .map(|e| &e.map)
            .collect()
    }

    /// Action the highest-priority active map prescribes for a machine
    /// state, e.g. `action_for("d-1", "ArtifactCommit_Enter")`.
    pub fn action_for(&self, id: &str, state: &str) -> Option<String> {
        self.get(id).into_iter().find_map(|map| {
            map.states
                .get(state)
                .and_then(|policy| policy.get("action"))
                .and_then(|action| action.as_str())
                .map(str::to_string)
        })
    }

    fn sort(&mut self) {
        for entries in self.maps.values_mut() {
            entries.sort_by(|a, b| b.map.priority.cmp(&a.map.priority));
        }
    }

    /// Persist the pool.
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let bytes = serde_json::to_vec(&self.maps).context("failed to serialize control maps")?;
        store.write(KEY_UPDATE_CONTROL_MAPS, &bytes)
    }

    /// Load the pool; boot-life windows restart from now.
    pub fn load(store: &dyn Store) -> Result<Self> {
        match store.read(KEY_UPDATE_CONTROL_MAPS)? {
            None => Ok(Self::new()),
            Some(bytes) => {
                let maps: BTreeMap<String, Vec<StampedMap>> = serde_json::from_slice(&bytes)
                    .context("failed to parse persisted control maps")?;
                Ok(Self { maps })
            }
        }
    }
}
