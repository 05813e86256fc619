//! Resumable artifact fetch.
//!
//! On a dropped connection the fetch is reissued with a `Range` header
//! for the bytes already on disk, with backoff between attempts, so a
//! flaky link never forces re-downloading a multi-hundred-megabyte
//! artifact from scratch.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use upkeep_retry::{RetryStrategyConfig, calculate_delay};

use crate::types::{ArtifactSource, Reporter};

/// Fetch `source` into `dest`, resuming across attempts. Returns the
/// final size in bytes.
pub fn fetch_artifact(
    http: &Client,
    source: &ArtifactSource,
    dest: &Path,
    retry: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<u64> {
    if let Some(expire) = source.expire
        && Utc::now() > expire
    {
        bail!("artifact link expired at {expire}");
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fetch_once(http, &source.uri, dest) {
            Ok(size) => return Ok(size),
            Err(e) => {
                if attempt >= retry.max_attempts {
                    return Err(e.context(format!("artifact fetch gave up after {attempt} attempts")));
                }
                let delay = calculate_delay(retry, attempt);
                reporter.warn(&format!(
                    "artifact fetch attempt {attempt} failed ({e:#}); retrying in {}",
                    humantime::format_duration(delay)
                ));
                std::thread::sleep(delay);
            }
        }
    }
}

fn fetch_once(http: &Client, uri: &str, dest: &Path) -> Result<u64> {
    let offset = match dest.metadata() {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = http.get(uri);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    let mut response = request.send().context("artifact request failed")?;

    let mut file = match response.status() {
        // Full body: the server ignored (or never saw) the range.
        StatusCode::OK => OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .with_context(|| format!("failed to open {}", dest.display()))?,
        StatusCode::PARTIAL_CONTENT => OpenOptions::new()
            .append(true)
            .open(dest)
            .with_context(|| format!("failed to open {} for resume", dest.display()))?,
        s => bail!("unexpected status while fetching artifact: {s}"),
    };

    std::io::copy(&mut response, &mut file).context("artifact transfer interrupted")?;
    Ok(dest
        .metadata()
        .with_context(|| format!("failed to stat {}", dest.display()))?
        .len())
}
