//! State script executor.
//!
//! Scripts named `<StateName>_<Phase>_<NN>[_description]` run at the
//! Enter/Leave/Error boundaries of each top-level state, ascending by the
//! two-digit ordering key. `Artifact*` states load their scripts from the
//! artifact script directory (extracted from the current artifact);
//! everything else comes from the rootfs script directory installed with
//! the OS.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::config::ScriptConfig;
use crate::process::run_command_with_timeout;
use crate::types::Reporter;

/// Exit code a script returns to request re-execution.
pub const RETRY_EXIT_CODE: i32 = 85;

/// State-script format versions this runtime supports.
pub const SUPPORTED_VERSIONS: &[u32] = &[2, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Leave,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Enter => "Enter",
            Phase::Leave => "Leave",
            Phase::Error => "Error",
        }
    }
}

/// Runs ordered script collections with per-script timeouts and
/// retry-requested re-execution.
pub struct ScriptRunner {
    config: ScriptConfig,
}

impl ScriptRunner {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    /// Verify the rootfs script directory declares a version this runtime
    /// supports. Scripts with no version file are refused; an absent or
    /// empty directory is fine.
    pub fn check_version(&self) -> Result<()> {
        check_dir_version(&self.config.rootfs_dir)
    }

    /// Run every script for `state`/`phase`, in order. The first failing
    /// script aborts the collection.
    pub fn run(&self, state: &str, phase: Phase, reporter: &mut dyn Reporter) -> Result<()> {
        let dir = self.dir_for(state);
        let scripts = collect_scripts(&dir, state, phase)?;
        for script in scripts {
            self.run_one(&script, reporter)?;
        }
        Ok(())
    }

    /// Error-phase collections are best-effort: failures are logged and
    /// swallowed.
    pub fn run_best_effort(&self, state: &str, phase: Phase, reporter: &mut dyn Reporter) {
        if let Err(e) = self.run(state, phase, reporter) {
            reporter.warn(&format!("{state}_{} script failed (ignored): {e:#}", phase.as_str()));
        }
    }

    fn dir_for(&self, state: &str) -> PathBuf {
        if state.starts_with("Artifact") {
            self.config.artifact_dir.clone()
        } else {
            self.config.rootfs_dir.clone()
        }
    }

    fn run_one(&self, script: &Path, reporter: &mut dyn Reporter) -> Result<()> {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let retry_deadline = Instant::now() + self.config.retry_timeout;
        let cwd = script.parent().unwrap_or(Path::new("/"));

        loop {
            reporter.info(&format!("running state script {name}"));
            let out = run_command_with_timeout(script, &[], cwd, self.config.timeout)?;

            if out.timed_out {
                bail!("state script {name} timed out");
            }
            match out.exit_code {
                0 => return Ok(()),
                RETRY_EXIT_CODE => {
                    if Instant::now() + self.config.retry_interval >= retry_deadline {
                        bail!("state script {name} kept requesting retries past its time budget");
                    }
                    reporter.info(&format!(
                        "state script {name} requested retry; re-running in {}",
                        humantime::format_duration(self.config.retry_interval)
                    ));
                    std::thread::sleep(self.config.retry_interval);
                }
                code => {
                    bail!(
                        "state script {name} failed with exit code {code}: {}",
                        tail(&out.stderr)
                    );
                }
            }
        }
    }
}

fn tail(s: &str) -> String {
    const MAX: usize = 512;
    let t = s.trim();
    if t.len() <= MAX {
        t.to_string()
    } else {
        t[t.len() - MAX..].to_string()
    }
}

fn check_dir_version(dir: &Path) -> Result<()> {
    let has_scripts = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .any(|e| parse_script_name(&e.file_name().to_string_lossy()).is_some()),
        Err(_) => return Ok(()),
    };

    let version_file = dir.join("version");
    let declared = match std::fs::read_to_string(&version_file) {
        Ok(content) => Some(
            content
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid version file {}", version_file.display()))?,
        ),
        Err(_) => None,
    };

    match declared {
        Some(v) if SUPPORTED_VERSIONS.contains(&v) => Ok(()),
        Some(v) => bail!(
            "state scripts in {} declare unsupported version {v} (supported: {SUPPORTED_VERSIONS:?})",
            dir.display()
        ),
        None if has_scripts => bail!(
            "state scripts in {} have no version file",
            dir.display()
        ),
        None => Ok(()),
    }
}

/// Scripts for one state/phase, sorted by the two-digit ordering key,
/// ties broken by full name.
fn collect_scripts(dir: &Path, state: &str, phase: Phase) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // No script directory means no scripts to run.
        Err(_) => return Ok(Vec::new()),
    };

    let mut matched: Vec<(u8, String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((s, p, nn)) = parse_script_name(&name)
            && s == state
            && p == phase
        {
            matched.push((nn, name, entry.path()));
        }
    }
    matched.sort();
    Ok(matched.into_iter().map(|(_, _, path)| path).collect())
}

/// Parse `<StateName>_<Phase>_<NN>[_description]`. Returns the state
/// name, phase, and ordering key; anything else is not a state script.
fn parse_script_name(name: &str) -> Option<(&str, Phase, u8)> {
    for (marker, phase) in [
        ("_Enter_", Phase::Enter),
        ("_Leave_", Phase::Leave),
        ("_Error_", Phase::Error),
    ] {
        if let Some(pos) = name.find(marker) {
            let state = &name[..pos];
            let rest = &name[pos + marker.len()..];
            if state.is_empty() || rest.len() < 2 {
                continue;
            }
            let (digits, desc) = rest.split_at(2);
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if !desc.is_empty() && !desc.starts_with('_') {
                continue;
            }
            let nn = digits.parse::<u8>().ok()?;
            return Some((state, phase, nn));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    struct CollectingReporter(Vec<String>);

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.0.push(msg.to_string());
        }
        fn warn(&mut self, msg: &str) {
            self.0.push(msg.to_string());
        }
        fn error(&mut self, msg: &str) {
            self.0.push(msg.to_string());
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
    }

    fn runner(rootfs: &Path, artifact: &Path) -> ScriptRunner {
        ScriptRunner::new(ScriptConfig {
            rootfs_dir: rootfs.to_path_buf(),
            artifact_dir: artifact.to_path_buf(),
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
            retry_timeout: Duration::from_millis(200),
        })
    }

    #[test]
    fn parses_script_names() {
        assert_eq!(
            parse_script_name("Download_Enter_05"),
            Some(("Download", Phase::Enter, 5))
        );
        assert_eq!(
            parse_script_name("ArtifactInstall_Leave_99_cleanup_tmp"),
            Some(("ArtifactInstall", Phase::Leave, 99))
        );
        assert_eq!(parse_script_name("version"), None);
        assert_eq!(parse_script_name("Download_Enter_5"), None);
        assert_eq!(parse_script_name("Download_Enter_ab"), None);
        assert_eq!(parse_script_name("_Enter_05"), None);
    }

    #[test]
    fn scripts_run_in_ascending_order() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        let log = rootfs.path().join("order.log");
        write_script(
            rootfs.path(),
            "Sync_Enter_20_second",
            &format!("echo 20 >> {}", log.display()),
        );
        write_script(
            rootfs.path(),
            "Sync_Enter_05_first",
            &format!("echo 05 >> {}", log.display()),
        );
        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        runner.run("Sync", Phase::Enter, &mut reporter).expect("run");

        let content = std::fs::read_to_string(&log).expect("read");
        assert_eq!(content, "05\n20\n");
    }

    #[test]
    fn artifact_states_use_artifact_dir() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        let log = artifact.path().join("ran.log");
        write_script(
            artifact.path(),
            "ArtifactInstall_Enter_01",
            &format!("echo ran >> {}", log.display()),
        );

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        runner
            .run("ArtifactInstall", Phase::Enter, &mut reporter)
            .expect("run");
        assert!(log.exists());
    }

    #[test]
    fn failing_script_aborts_collection() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        let log = rootfs.path().join("ran.log");
        write_script(rootfs.path(), "Sync_Enter_01", "exit 1");
        write_script(
            rootfs.path(),
            "Sync_Enter_02",
            &format!("echo too-far >> {}", log.display()),
        );
        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        assert!(runner.run("Sync", Phase::Enter, &mut reporter).is_err());
        assert!(!log.exists());
    }

    #[test]
    fn retry_code_reruns_until_budget_expires() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        // Succeeds on the third run.
        let counter = rootfs.path().join("count");
        write_script(
            rootfs.path(),
            "Sync_Enter_01",
            &format!(
                "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 3 ] && exit 0; exit 85",
                c = counter.display()
            ),
        );
        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        runner.run("Sync", Phase::Enter, &mut reporter).expect("run");
        assert_eq!(std::fs::read_to_string(&counter).expect("read").trim(), "3");
    }

    #[test]
    fn endless_retry_hits_time_budget() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        write_script(rootfs.path(), "Sync_Enter_01", "exit 85");
        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        let err = runner.run("Sync", Phase::Enter, &mut reporter).unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn best_effort_swallows_failures() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        write_script(rootfs.path(), "Sync_Error_01", "exit 1");
        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");

        let runner = runner(rootfs.path(), artifact.path());
        let mut reporter = CollectingReporter(Vec::new());
        runner.run_best_effort("Sync", Phase::Error, &mut reporter);
        assert!(reporter.0.iter().any(|m| m.contains("ignored")));
    }

    #[test]
    fn version_gate_rejects_unsupported_and_missing_versions() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        write_script(rootfs.path(), "Sync_Enter_01", "exit 0");

        // Scripts without a version file are refused.
        let r = runner(rootfs.path(), artifact.path());
        assert!(r.check_version().is_err());

        std::fs::write(rootfs.path().join("version"), "1\n").expect("write");
        assert!(r.check_version().is_err());

        std::fs::write(rootfs.path().join("version"), "3\n").expect("write");
        r.check_version().expect("supported");
    }

    #[test]
    fn empty_or_missing_dir_passes_version_gate() {
        let rootfs = tempdir().expect("tempdir");
        let artifact = tempdir().expect("tempdir");
        let r = runner(&rootfs.path().join("nope"), artifact.path());
        r.check_version().expect("missing dir is fine");
    }
}
