//! Inventory collection.
//!
//! Built-in attributes (device type, installed artifact, kernel, OS,
//! client version) merged with the output of executable inventory
//! scripts. Scripts print `name=value` lines on stdout; repeated names
//! aggregate into lists. A stable hash of the canonical payload lets the
//! submitter skip resubmitting an unchanged inventory.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use upkeep_store::Store;

use crate::journal;
use crate::process::run_command_with_timeout;
use crate::types::Reporter;

/// Attribute value; numbers are serialized unquoted, repeated names
/// become lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InventoryValue {
    String(String),
    Number(serde_json::Number),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: InventoryValue,
}

/// Collect the full inventory: built-ins first, then script output.
/// Scripts override nothing; they add attributes or extend lists.
pub fn collect(
    scripts_dir: &Path,
    store: &dyn Store,
    device_type: &str,
    reporter: &mut dyn Reporter,
) -> Result<Vec<InventoryAttribute>> {
    let mut attributes: BTreeMap<String, InventoryValue> = BTreeMap::new();

    attributes.insert(
        "device_type".to_string(),
        InventoryValue::String(device_type.to_string()),
    );
    let artifact_name = journal::installed_artifact_name(store)
        .map_err(anyhow::Error::from)?
        .unwrap_or_else(|| "unknown".to_string());
    attributes.insert("artifact_name".to_string(), InventoryValue::String(artifact_name));
    if let Some(group) = journal::installed_artifact_group(store).map_err(anyhow::Error::from)? {
        attributes.insert("artifact_group".to_string(), InventoryValue::String(group));
    }
    attributes.insert(
        "upkeep_client_version".to_string(),
        InventoryValue::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    attributes.insert(
        "os".to_string(),
        InventoryValue::String(std::env::consts::OS.to_string()),
    );
    if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
        attributes.insert(
            "kernel".to_string(),
            InventoryValue::String(release.trim().to_string()),
        );
    }

    for script in executable_scripts(scripts_dir) {
        let out = run_command_with_timeout(&script, &[], scripts_dir, Duration::from_secs(60))?;
        if out.timed_out || out.exit_code != 0 {
            reporter.warn(&format!(
                "inventory script {} failed (exit {}); skipping its output",
                script.display(),
                out.exit_code
            ));
            continue;
        }
        merge_script_output(&mut attributes, &out.stdout);
    }

    Ok(attributes
        .into_iter()
        .map(|(name, value)| InventoryAttribute { name, value })
        .collect())
}

fn executable_scripts(dir: &Path) -> Vec<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.metadata()
                    .map(|m| m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
        })
        .collect();
    scripts.sort();
    scripts
}

/// Parse `name=value` lines; repeated names aggregate into lists,
/// numeric single values stay numeric.
fn merge_script_output(attributes: &mut BTreeMap<String, InventoryValue>, stdout: &str) {
    for line in stdout.lines() {
        let line = line.trim();
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() {
            continue;
        }
        match attributes.get_mut(name) {
            None => {
                let v = if let Ok(n) = value.parse::<i64>() {
                    InventoryValue::Number(n.into())
                } else if let Ok(f) = value.parse::<f64>()
                    && let Some(n) = serde_json::Number::from_f64(f)
                {
                    InventoryValue::Number(n)
                } else {
                    InventoryValue::String(value.to_string())
                };
                attributes.insert(name.to_string(), v);
            }
            Some(InventoryValue::List(list)) => list.push(value.to_string()),
            Some(existing) => {
                let first = match existing {
                    InventoryValue::String(s) => s.clone(),
                    InventoryValue::Number(n) => n.to_string(),
                    InventoryValue::List(_) => unreachable!(),
                };
                *existing = InventoryValue::List(vec![first, value.to_string()]);
            }
        }
    }
}

/// Stable digest of the submitted payload; unchanged inventories are not
/// resubmitted.
pub fn payload_hash(attributes: &[InventoryAttribute]) -> Result<String> {
    let canonical =
        serde_json::to_vec(attributes).context("failed to serialize inventory payload")?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
