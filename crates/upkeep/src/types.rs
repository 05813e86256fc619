use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Suffix appended to the stored artifact name when a deployment committed
/// but could not finish cleanly (post-commit leave failure, loop break).
/// Inventory picks it up on the next cycle.
pub const INCONSISTENT_SUFFIX: &str = "_INCONSISTENT";

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Whether a payload needs the device rebooted after install, as answered
/// by its update module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootRequest {
    /// Module answered `No`
    #[default]
    None,
    /// Module answered `Yes`: the module performs the reboot itself
    Custom,
    /// Module answered `Automatic`: the client reboots the device
    Automatic,
}

/// Whether the payload's update module can roll an install back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackSupport {
    /// Not queried yet
    #[default]
    Unknown,
    /// Module answered `Yes`
    Supported,
    /// Module answered `No`
    NotSupported,
}

/// Where the artifact bytes come from, and until when the link is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<DateTime<Utc>>,
}

/// Server-issued update intent, as returned by the deployment poll.
///
/// Artifact metadata (compatibility, provides, depends) rides along with
/// the deployment; the signed-archive parser that would extract it from
/// the artifact itself is an external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
    pub source: ArtifactSource,
    #[serde(default)]
    pub device_types_compatible: Vec<String>,
    /// Exactly one in practice.
    #[serde(default)]
    pub payload_types: Vec<String>,
    /// Key→value pairs this artifact publishes on success.
    #[serde(default)]
    pub type_info_provides: BTreeMap<String, String>,
    /// Glob patterns of existing provides to erase on success.
    #[serde(default)]
    pub clears_artifact_provides: Vec<String>,
    /// Key→value pairs that must match the device's current provides.
    #[serde(default)]
    pub artifact_depends: BTreeMap<String, String>,
    /// Free-form payload metadata handed to the update module verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Value>,
}

/// Everything the journal remembers about the deployment in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub deployment: Deployment,
    /// One entry per payload.
    #[serde(default)]
    pub reboot_requested: Vec<RebootRequest>,
    #[serde(default)]
    pub supports_rollback: RollbackSupport,
    /// Incremented on every journal write; hard-capped, see the journal.
    #[serde(default)]
    pub state_data_store_count: u32,
    /// Set when the record was written under the uncommitted schema slot.
    #[serde(default)]
    pub has_db_schema_update: bool,
    /// Set once all payloads have rolled back cleanly.
    #[serde(default)]
    pub all_rollbacks_successful: bool,
}

impl UpdateInfo {
    pub fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            ..Default::default()
        }
    }

    /// The single payload type of this deployment.
    pub fn payload_type(&self) -> Option<&str> {
        self.deployment.payload_types.first().map(String::as_str)
    }
}

/// The only value the core writes to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateData {
    /// Journal schema version, not the artifact version.
    pub version: u32,
    /// Name of the state that wrote this record.
    pub name: String,
    pub update_info: UpdateInfo,
}

/// Server-visible deployment status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Rebooting,
    Failure,
    Success,
    AlreadyInstalled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::Success => "success",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classification fixed at capture; the class decides propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried locally; otherwise the state's Failure arc is taken
    #[default]
    Transient,
    /// Aborts the current deployment, with rollback if supported
    FatalDeployment,
    /// Aborts the event loop
    FatalProcess,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::FatalDeployment => "fatal-to-deployment",
            ErrorClass::FatalProcess => "fatal-to-process",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for progress narration. The daemon installs a stderr reporter,
/// tests install a collecting one.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that writes to stderr with a level prefix.
#[derive(Default)]
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("info: {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("warn: {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("error: {msg}");
    }
}

/// Match `pattern` against `value` where `*` matches any run of
/// characters. Used for `clears_artifact_provides` erasure.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while vi < v.len() {
        if pi < p.len() && (p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
