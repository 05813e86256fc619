//! Device-facing update server API.
//!
//! One blocking HTTP client for the four server surfaces: deployment
//! poll, status reporting, deployment log upload and inventory
//! submission. Status reporting owns the at-most-once rule for the
//! `failure` status, and distinguishes a server-side abort (fatal to the
//! deployment) from transient reporting errors.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::controlmap::ControlMap;
use crate::deploylog::LogEntry;
use crate::inventory::InventoryAttribute;
use crate::types::{ArtifactSource, Deployment, DeploymentStatus};

const DEPLOYMENTS_NEXT: &str = "/api/devices/v1/deployments/device/deployments/next";
const DEPLOYMENTS_STATUS: &str = "/api/devices/v1/deployments/device/deployments";
const INVENTORY_ATTRIBUTES: &str = "/api/devices/v1/inventory/device/attributes";

/// What a deployment poll produced.
#[derive(Debug)]
pub enum PollOutcome {
    Deployment(Box<PolledDeployment>),
    NoDeployment,
}

#[derive(Debug)]
pub struct PolledDeployment {
    pub deployment: Deployment,
    pub control_map: Option<ControlMap>,
}

/// Status reporting failure modes.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Server answered 409: the deployment was aborted. Fatal — the
    /// machine stops the deployment and skips remaining stages.
    #[error("deployment aborted by the server")]
    Aborted,
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

pub struct DeviceApi {
    base: String,
    http: Client,
    failure_reported: BTreeSet<String>,
    last_progress: BTreeMap<String, DeploymentStatus>,
    last_inventory_hash: Option<String>,
}

impl DeviceApi {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("upkeep/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base: server_url.trim_end_matches('/').to_string(),
            http,
            failure_reported: BTreeSet::new(),
            last_progress: BTreeMap::new(),
            last_inventory_hash: None,
        })
    }

    /// Ask the server for the next deployment. The request body is the
    /// full provides snapshot; older servers that 404 on the POST route
    /// get the legacy GET with query parameters.
    pub fn poll_deployment(
        &self,
        provides: &BTreeMap<String, String>,
        device_type: &str,
    ) -> Result<PollOutcome> {
        let url = format!("{}{DEPLOYMENTS_NEXT}", self.base);
        let mut body = provides.clone();
        body.entry("device_type".to_string())
            .or_insert_with(|| device_type.to_string());

        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "device_provides": body }))
            .send()
            .context("deployment poll request failed")?;

        match resp.status() {
            StatusCode::OK => parse_deployment(resp).map(|d| PollOutcome::Deployment(Box::new(d))),
            StatusCode::NO_CONTENT => Ok(PollOutcome::NoDeployment),
            StatusCode::NOT_FOUND => self.poll_deployment_legacy(provides, device_type),
            s => bail!("unexpected status while polling for deployments: {s}"),
        }
    }

    fn poll_deployment_legacy(
        &self,
        provides: &BTreeMap<String, String>,
        device_type: &str,
    ) -> Result<PollOutcome> {
        let artifact_name = provides
            .get("artifact_name")
            .map(String::as_str)
            .unwrap_or("unknown");
        let url = format!("{}{DEPLOYMENTS_NEXT}", self.base);

        let resp = self
            .http
            .get(&url)
            .query(&[("artifact_name", artifact_name), ("device_type", device_type)])
            .send()
            .context("legacy deployment poll request failed")?;

        match resp.status() {
            StatusCode::OK => parse_deployment(resp).map(|d| PollOutcome::Deployment(Box::new(d))),
            StatusCode::NO_CONTENT => Ok(PollOutcome::NoDeployment),
            s => bail!("unexpected status from legacy deployment poll: {s}"),
        }
    }

    /// Report a deployment status. `failure` is sent at most once per
    /// deployment id; later attempts are silently dropped. Progress
    /// statuses are only sent when they change, so a commit without an
    /// intervening reboot does not repeat `installing` on the wire.
    pub fn report_status(
        &mut self,
        deployment_id: &str,
        status: DeploymentStatus,
        substate: Option<&str>,
    ) -> Result<(), ReportError> {
        if status == DeploymentStatus::Failure && self.failure_reported.contains(deployment_id) {
            return Ok(());
        }
        let progress = matches!(
            status,
            DeploymentStatus::Downloading | DeploymentStatus::Installing | DeploymentStatus::Rebooting
        );
        if progress && self.last_progress.get(deployment_id) == Some(&status) {
            return Ok(());
        }

        let url = format!("{}{DEPLOYMENTS_STATUS}/{deployment_id}/status", self.base);
        let mut body = serde_json::json!({ "status": status.as_str() });
        if let Some(substate) = substate {
            body["substate"] = serde_json::Value::String(substate.to_string());
        }

        let resp = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .context("status report request failed")?;

        match resp.status() {
            s if s.is_success() => {
                if status == DeploymentStatus::Failure {
                    self.failure_reported.insert(deployment_id.to_string());
                }
                if progress {
                    self.last_progress
                        .insert(deployment_id.to_string(), status);
                }
                Ok(())
            }
            StatusCode::CONFLICT => Err(ReportError::Aborted),
            s => Err(ReportError::Transient(anyhow!(
                "unexpected status while reporting {status}: {s}"
            ))),
        }
    }

    /// True when `failure` was already reported for this deployment.
    pub fn failure_reported(&self, deployment_id: &str) -> bool {
        self.failure_reported.contains(deployment_id)
    }

    /// Forget per-deployment reporting state once a deployment is done.
    pub fn end_deployment(&mut self, deployment_id: &str) {
        self.failure_reported.remove(deployment_id);
        self.last_progress.remove(deployment_id);
    }

    /// Upload the deployment log.
    pub fn upload_log(&self, deployment_id: &str, entries: &[LogEntry]) -> Result<()> {
        let url = format!("{}{DEPLOYMENTS_STATUS}/{deployment_id}/log", self.base);
        let resp = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "messages": entries }))
            .send()
            .context("log upload request failed")?;
        if !resp.status().is_success() {
            bail!("unexpected status while uploading deployment log: {}", resp.status());
        }
        Ok(())
    }

    /// Submit inventory, unless it is identical to the last accepted
    /// submission. Returns whether anything was sent.
    pub fn submit_inventory(&mut self, attributes: &[InventoryAttribute]) -> Result<bool> {
        let hash = crate::inventory::payload_hash(attributes)?;
        if self.last_inventory_hash.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        let url = format!("{}{INVENTORY_ATTRIBUTES}", self.base);
        let resp = self
            .http
            .put(&url)
            .json(attributes)
            .send()
            .context("inventory submission request failed")?;
        if !resp.status().is_success() {
            bail!("unexpected status while submitting inventory: {}", resp.status());
        }
        self.last_inventory_hash = Some(hash);
        Ok(true)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }
}

#[derive(Debug, Deserialize)]
struct WireDeployment {
    id: String,
    artifact: WireArtifact,
    #[serde(default)]
    update_control_map: Option<ControlMap>,
}

#[derive(Debug, Deserialize)]
struct WireArtifact {
    source: ArtifactSource,
    artifact_name: String,
    #[serde(default)]
    artifact_group: Option<String>,
    #[serde(default)]
    device_types_compatible: Vec<String>,
    #[serde(default)]
    payload_types: Vec<String>,
    #[serde(default)]
    type_info_provides: BTreeMap<String, String>,
    #[serde(default)]
    clears_artifact_provides: Vec<String>,
    #[serde(default)]
    artifact_depends: BTreeMap<String, String>,
    #[serde(default)]
    meta_data: Option<serde_json::Value>,
}

fn parse_deployment(resp: reqwest::blocking::Response) -> Result<PolledDeployment> {
    let wire: WireDeployment = resp.json().context("failed to parse deployment JSON")?;
    let artifact = wire.artifact;
    Ok(PolledDeployment {
        deployment: Deployment {
            id: wire.id,
            artifact_name: artifact.artifact_name,
            artifact_group: artifact.artifact_group,
            source: artifact.source,
            device_types_compatible: artifact.device_types_compatible,
            payload_types: artifact.payload_types,
            type_info_provides: artifact.type_info_provides,
            clears_artifact_provides: artifact.clears_artifact_provides,
            artifact_depends: artifact.artifact_depends,
            meta_data: artifact.meta_data,
        },
        control_map: wire.update_control_map,
    })
}
