//! Configuration file support (`upkeep.toml`).
//!
//! The daemon reads one TOML file (default `/etc/upkeep/upkeep.toml`),
//! every field has a default, and CLI flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use upkeep_retry::{RetryPolicy, RetryStrategyConfig};

use crate::types::{deserialize_duration, serialize_duration};

/// Default configuration file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/upkeep/upkeep.toml";

/// Nested retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry policy preset: default, aggressive, conservative, or custom
    #[serde(default)]
    pub policy: RetryPolicy,

    /// Explicit strategy, used when the policy is `custom`
    #[serde(default)]
    pub strategy: RetryStrategyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            strategy: RetryStrategyConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Resolve the preset/custom split into one concrete strategy.
    pub fn resolve(&self) -> RetryStrategyConfig {
        match self.policy {
            RetryPolicy::Custom => self.strategy.clone(),
            preset => preset.to_config(),
        }
    }
}

/// Nested state-script configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Scripts installed with the OS image.
    #[serde(default = "default_rootfs_scripts_dir")]
    pub rootfs_dir: PathBuf,

    /// Scripts extracted from the current artifact.
    #[serde(default = "default_artifact_scripts_dir")]
    pub artifact_dir: PathBuf,

    /// Per-script execution timeout.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_script_timeout")]
    pub timeout: Duration,

    /// Delay between re-executions when a script exits with the retry code.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_script_retry_interval")]
    pub retry_interval: Duration,

    /// Global budget for retry-requested re-executions of one script.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_script_retry_timeout")]
    pub retry_timeout: Duration,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            rootfs_dir: default_rootfs_scripts_dir(),
            artifact_dir: default_artifact_scripts_dir(),
            timeout: default_script_timeout(),
            retry_interval: default_script_retry_interval(),
            retry_timeout: default_script_retry_timeout(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the update server, e.g. `https://updates.example.com`.
    pub server_url: String,

    /// File holding the device type (`device_type=<name>` or a bare name).
    pub device_type_file: PathBuf,

    /// Directory for the store, deployment logs and download scratch space.
    pub data_dir: PathBuf,

    /// Directory holding update-module executables, one per payload type.
    pub module_dir: PathBuf,

    /// Whole-subprocess timeout for one update-module invocation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub module_timeout: Duration,

    /// Directory of executable inventory scripts.
    pub inventory_scripts_dir: PathBuf,

    /// How often to poll for deployments while idle.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub update_poll_interval: Duration,

    /// How often to submit inventory while idle.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub inventory_poll_interval: Duration,

    /// Per-request HTTP timeout.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub http_timeout: Duration,

    pub scripts: ScriptConfig,

    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://updates.example.com".to_string(),
            device_type_file: PathBuf::from("/var/lib/upkeep/device_type"),
            data_dir: PathBuf::from("/var/lib/upkeep"),
            module_dir: PathBuf::from("/usr/share/upkeep/modules/v3"),
            module_timeout: Duration::from_secs(4 * 3600),
            inventory_scripts_dir: PathBuf::from("/usr/share/upkeep/inventory"),
            update_poll_interval: Duration::from_secs(1800),
            inventory_poll_interval: Duration::from_secs(28800),
            http_timeout: Duration::from_secs(60),
            scripts: ScriptConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_rootfs_scripts_dir() -> PathBuf {
    PathBuf::from("/etc/upkeep/scripts")
}

fn default_artifact_scripts_dir() -> PathBuf {
    PathBuf::from("/var/lib/upkeep/scripts")
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_script_retry_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_script_retry_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a present but malformed file is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at all.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            bail!("server_url must not be empty");
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            bail!("server_url must start with http:// or https://: {}", self.server_url);
        }
        if self.update_poll_interval.is_zero() {
            bail!("update_poll_interval must be greater than zero");
        }
        if self.inventory_poll_interval.is_zero() {
            bail!("inventory_poll_interval must be greater than zero");
        }
        Ok(())
    }

    /// Read the device type from `device_type_file`. Accepts the
    /// `device_type=<name>` form or a bare one-line name.
    pub fn device_type(&self) -> Result<String> {
        let content = std::fs::read_to_string(&self.device_type_file).with_context(|| {
            format!(
                "failed to read device type file {}",
                self.device_type_file.display()
            )
        })?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value = line.strip_prefix("device_type=").unwrap_or(line).trim();
            if value.is_empty() {
                break;
            }
            return Ok(value.to_string());
        }
        bail!(
            "device type file {} holds no device type",
            self.device_type_file.display()
        )
    }

    /// Directory the store lives in.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Scratch directory for the deployment currently in flight.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// Directory deployment logs are written to.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }
}
