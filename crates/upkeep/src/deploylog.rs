//! Per-deployment JSONL log.
//!
//! One append-only file per deployment id; its entries are the body of
//! the server log upload when a deployment fails. Lines that did not
//! survive on disk (truncated writes, corruption) are replaced by
//! synthetic ERROR placeholders before transmission, carrying the first
//! valid timestamp forward so the server still gets a plausible ordering.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Append-only log for one deployment.
pub struct DeploymentLog {
    path: PathBuf,
}

impl DeploymentLog {
    /// Open (or create) the log for `deployment_id` under `dir`.
    pub fn open(dir: &Path, deployment_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        Ok(Self {
            path: dir.join(format!("deployment.{deployment_id}.log")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, level: &str, message: &str) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
        };
        let line = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open log file {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Read the log back for upload, repairing malformed lines.
    pub fn read_for_upload(&self) -> Result<Vec<LogEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read log file {}", self.path.display())));
            }
        };

        let mut entries = Vec::new();
        let mut carried_timestamp: Option<DateTime<Utc>> = None;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => {
                    carried_timestamp.get_or_insert(entry.timestamp);
                    entries.push(entry);
                }
                Err(_) => entries.push(LogEntry {
                    timestamp: carried_timestamp.unwrap_or_else(Utc::now),
                    level: "ERROR".to_string(),
                    message: "malformed log entry replaced during upload".to_string(),
                }),
            }
        }
        Ok(entries)
    }

    /// Delete the file; called once the deployment is fully finished.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to remove log file {}", self.path.display()))),
        }
    }
}
