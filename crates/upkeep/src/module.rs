//! Update module runner.
//!
//! An update module is one external executable per payload type, invoked
//! as `<module> <state-name>` inside a prepared working tree. Payload
//! bytes are handed over through a twin-FIFO stream protocol so large
//! artifacts never need to be buffered in memory; modules that cannot
//! consume streams fall through to ordinary files under `files/`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;

use crate::process::{CommandOutput, wait_with_deadline};
use crate::types::{RebootRequest, Reporter, UpdateInfo};

/// Protocol version written to the working tree.
pub const MODULE_PROTO_VERSION: &str = "3";

/// States an update module can be invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Download,
    ArtifactInstall,
    NeedsArtifactReboot,
    ArtifactReboot,
    ArtifactCommit,
    SupportsRollback,
    ArtifactRollback,
    ArtifactVerifyReboot,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
}

impl ModuleState {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ModuleState::Download => "Download",
            ModuleState::ArtifactInstall => "ArtifactInstall",
            ModuleState::NeedsArtifactReboot => "NeedsArtifactReboot",
            ModuleState::ArtifactReboot => "ArtifactReboot",
            ModuleState::ArtifactCommit => "ArtifactCommit",
            ModuleState::SupportsRollback => "SupportsRollback",
            ModuleState::ArtifactRollback => "ArtifactRollback",
            ModuleState::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            ModuleState::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ModuleState::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            ModuleState::ArtifactFailure => "ArtifactFailure",
            ModuleState::Cleanup => "Cleanup",
        }
    }
}

/// How an invocation went wrong. The machine routes all of these to its
/// Failure arc; the distinction is for the logs.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("update module exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("update module timed out")]
    Timeout,
    #[error("update module protocol error: {0}")]
    Protocol(String),
    #[error("broken pipe while streaming payload {0}")]
    BrokenPipe(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModuleError {
    /// Classification at capture: a broken pipe may heal on a retried
    /// deployment, everything else ends this one.
    pub fn class(&self) -> crate::types::ErrorClass {
        match self {
            ModuleError::BrokenPipe(_) => crate::types::ErrorClass::Transient,
            _ => crate::types::ErrorClass::FatalDeployment,
        }
    }
}

pub type ModuleResult<T> = Result<T, ModuleError>;

/// One payload to hand to the module's `Download` state.
#[derive(Debug, Clone)]
pub struct PayloadFile {
    /// Name the module sees under `streams/` or `files/`.
    pub name: String,
    /// Where the fetched bytes live.
    pub path: PathBuf,
}

/// Invokes one payload type's update module in a prepared working tree.
pub struct ModuleRunner {
    module_path: PathBuf,
    tree: PathBuf,
    timeout: Duration,
}

impl ModuleRunner {
    /// `module_dir` holds one executable per payload type; `tree` is the
    /// working directory owned by this runner for the invocation.
    pub fn new(
        module_dir: &Path,
        payload_type: &str,
        tree: PathBuf,
        timeout: Duration,
    ) -> ModuleResult<Self> {
        let module_path = module_dir.join(payload_type);
        if !module_path.is_file() {
            return Err(ModuleError::Other(anyhow::anyhow!(
                "no update module for payload type {payload_type} at {}",
                module_path.display()
            )));
        }
        Ok(Self {
            module_path,
            tree,
            timeout,
        })
    }

    pub fn tree(&self) -> &Path {
        &self.tree
    }

    /// Write the working-tree contract the module relies on.
    pub fn prepare_tree(
        &self,
        info: &UpdateInfo,
        device_type: &str,
        current_artifact_name: &str,
        current_artifact_group: &str,
    ) -> ModuleResult<()> {
        let deployment = &info.deployment;
        let payload_type = info.payload_type().unwrap_or_default();
        let header = self.tree.join("header");

        fs::create_dir_all(&header)
            .with_context(|| format!("failed to create {}", header.display()))
            .map_err(ModuleError::Other)?;
        fs::create_dir_all(self.tree.join("tmp"))
            .context("failed to create module tmp dir")
            .map_err(ModuleError::Other)?;

        write_line(&self.tree.join("version"), MODULE_PROTO_VERSION)?;
        write_line(&self.tree.join("current_artifact_name"), current_artifact_name)?;
        write_line(&self.tree.join("current_artifact_group"), current_artifact_group)?;
        write_line(&self.tree.join("current_device_type"), device_type)?;

        write_line(&header.join("artifact_name"), &deployment.artifact_name)?;
        write_line(
            &header.join("artifact_group"),
            deployment.artifact_group.as_deref().unwrap_or_default(),
        )?;
        write_line(&header.join("payload_type"), payload_type)?;

        let header_info = serde_json::json!({
            "payloads": [{"type": payload_type}],
            "artifact_provides": deployment.type_info_provides,
            "artifact_depends": deployment.artifact_depends,
        });
        write_json(&header.join("header-info"), &header_info)?;

        let type_info = serde_json::json!({
            "type": payload_type,
            "artifact_provides": deployment.type_info_provides,
            "clears_artifact_provides": deployment.clears_artifact_provides,
        });
        write_json(&header.join("type-info"), &type_info)?;

        let meta_data = deployment
            .meta_data
            .clone()
            .unwrap_or(serde_json::Value::Null);
        write_json(&header.join("meta-data"), &meta_data)?;

        Ok(())
    }

    /// Invoke a plain state: success or a classified failure.
    pub fn call(&self, state: ModuleState, reporter: &mut dyn Reporter) -> ModuleResult<()> {
        reporter.info(&format!("update module: {}", state.as_arg()));
        let out = self.run_capture(state)?;
        classify(&out).map(|_| ())
    }

    /// `NeedsArtifactReboot`: the module answers `Yes`, `No` or
    /// `Automatic` on the first line of stdout.
    pub fn needs_reboot(&self, reporter: &mut dyn Reporter) -> ModuleResult<RebootRequest> {
        reporter.info("update module: NeedsArtifactReboot");
        let out = self.run_capture(ModuleState::NeedsArtifactReboot)?;
        let stdout = classify(&out)?;
        match parse_answer(&stdout, &["Yes", "No", "Automatic"])? {
            "Yes" => Ok(RebootRequest::Custom),
            "Automatic" => Ok(RebootRequest::Automatic),
            _ => Ok(RebootRequest::None),
        }
    }

    /// `SupportsRollback`: `Yes` or `No`.
    pub fn supports_rollback(&self, reporter: &mut dyn Reporter) -> ModuleResult<bool> {
        reporter.info("update module: SupportsRollback");
        let out = self.run_capture(ModuleState::SupportsRollback)?;
        let stdout = classify(&out)?;
        Ok(parse_answer(&stdout, &["Yes", "No"])? == "Yes")
    }

    /// `Download`: run the stream protocol, falling back to file mode
    /// when the module closes `stream-next` without reading any entry.
    pub fn download(
        &self,
        payloads: &[PayloadFile],
        reporter: &mut dyn Reporter,
    ) -> ModuleResult<()> {
        reporter.info("update module: Download (streaming)");

        let stream_next = self.tree.join("stream-next");
        let streams_dir = self.tree.join("streams");
        fs::create_dir_all(&streams_dir)
            .context("failed to create streams dir")
            .map_err(ModuleError::Other)?;
        make_fifo(&stream_next)?;
        for payload in payloads {
            make_fifo(&streams_dir.join(&payload.name))?;
        }

        let mut child = Command::new(&self.module_path)
            .arg(ModuleState::Download.as_arg())
            .current_dir(&self.tree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.module_path.display()))
            .map_err(ModuleError::Other)?;

        let deadline = Instant::now() + self.timeout;

        match self.stream_payloads(&mut child, payloads, deadline) {
            Ok(()) => {
                let out = wait_with_deadline(&mut child, deadline, "update module")
                    .map_err(ModuleError::Other)?;
                classify(&out).map(|_| ())
            }
            Err(StreamAbort::FileMode) => {
                reporter.info("update module ignored the stream protocol; using file mode");
                self.remove_stream_plumbing(payloads)?;
                self.write_payload_files(payloads)?;
                let out = wait_with_deadline(&mut child, deadline, "update module")
                    .map_err(ModuleError::Other)?;
                classify(&out).map(|_| ())
            }
            Err(StreamAbort::Fail(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn stream_payloads(
        &self,
        child: &mut Child,
        payloads: &[PayloadFile],
        deadline: Instant,
    ) -> Result<(), StreamAbort> {
        let stream_next = self.tree.join("stream-next");

        for (index, payload) in payloads.iter().enumerate() {
            let entry = format!("streams/{}\n", payload.name);

            let mut writer = match open_fifo_writer(&stream_next, deadline, child)? {
                FifoWriter::Opened(f) => f,
                FifoWriter::ChildExited => {
                    // Module never read an entry: the agreed fallback
                    // condition, but only before the first entry.
                    if index == 0 {
                        return Err(StreamAbort::FileMode);
                    }
                    return Err(StreamAbort::Fail(ModuleError::BrokenPipe(
                        payload.name.clone(),
                    )));
                }
            };

            match write_all_fifo(&mut writer, entry.as_bytes(), deadline, child) {
                Ok(()) => {}
                Err(WriteFail::Closed) if index == 0 => return Err(StreamAbort::FileMode),
                Err(WriteFail::Closed) => {
                    return Err(StreamAbort::Fail(ModuleError::BrokenPipe(
                        payload.name.clone(),
                    )));
                }
                Err(WriteFail::Timeout) => return Err(StreamAbort::Fail(ModuleError::Timeout)),
                Err(WriteFail::Io(e)) => return Err(StreamAbort::Fail(ModuleError::Other(e))),
            }
            drop(writer);

            self.stream_one(child, payload, deadline)?;
        }

        // Final empty write: opening stream-next and closing it right
        // away gives the module EOF on its next entry read.
        match open_fifo_writer(&stream_next, deadline, child)? {
            FifoWriter::Opened(f) => drop(f),
            FifoWriter::ChildExited => {}
        }
        Ok(())
    }

    fn stream_one(
        &self,
        child: &mut Child,
        payload: &PayloadFile,
        deadline: Instant,
    ) -> Result<(), StreamAbort> {
        let fifo = self.tree.join("streams").join(&payload.name);
        let mut writer = match open_fifo_writer(&fifo, deadline, child)? {
            FifoWriter::Opened(f) => f,
            FifoWriter::ChildExited => {
                return Err(StreamAbort::Fail(ModuleError::BrokenPipe(
                    payload.name.clone(),
                )));
            }
        };

        let mut source = File::open(&payload.path)
            .with_context(|| format!("failed to open payload {}", payload.path.display()))
            .map_err(|e| StreamAbort::Fail(ModuleError::Other(e)))?;

        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = source
                .read(&mut buf)
                .with_context(|| format!("failed to read payload {}", payload.path.display()))
                .map_err(|e| StreamAbort::Fail(ModuleError::Other(e)))?;
            if n == 0 {
                break;
            }
            match write_all_fifo(&mut writer, &buf[..n], deadline, child) {
                Ok(()) => {}
                Err(WriteFail::Closed) => {
                    return Err(StreamAbort::Fail(ModuleError::BrokenPipe(
                        payload.name.clone(),
                    )));
                }
                Err(WriteFail::Timeout) => return Err(StreamAbort::Fail(ModuleError::Timeout)),
                Err(WriteFail::Io(e)) => return Err(StreamAbort::Fail(ModuleError::Other(e))),
            }
        }
        Ok(())
    }

    fn remove_stream_plumbing(&self, payloads: &[PayloadFile]) -> ModuleResult<()> {
        let _ = fs::remove_file(self.tree.join("stream-next"));
        for payload in payloads {
            let _ = fs::remove_file(self.tree.join("streams").join(&payload.name));
        }
        let _ = fs::remove_dir(self.tree.join("streams"));
        Ok(())
    }

    fn write_payload_files(&self, payloads: &[PayloadFile]) -> ModuleResult<()> {
        let files = self.tree.join("files");
        fs::create_dir_all(&files)
            .context("failed to create files dir")
            .map_err(ModuleError::Other)?;
        for payload in payloads {
            fs::copy(&payload.path, files.join(&payload.name))
                .with_context(|| format!("failed to write files/{}", payload.name))
                .map_err(ModuleError::Other)?;
        }
        Ok(())
    }

    fn run_capture(&self, state: ModuleState) -> ModuleResult<CommandOutput> {
        let mut child = Command::new(&self.module_path)
            .arg(state.as_arg())
            .current_dir(&self.tree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.module_path.display()))
            .map_err(ModuleError::Other)?;
        wait_with_deadline(&mut child, Instant::now() + self.timeout, "update module")
            .map_err(ModuleError::Other)
    }
}

fn classify(out: &CommandOutput) -> ModuleResult<String> {
    if out.timed_out {
        return Err(ModuleError::Timeout);
    }
    if out.exit_code != 0 {
        return Err(ModuleError::Exit {
            code: out.exit_code,
            stderr: out.stderr.trim().chars().take(512).collect(),
        });
    }
    Ok(out.stdout.clone())
}

/// First stdout line must be one of `allowed`; anything after it must be
/// whitespace.
fn parse_answer<'a>(stdout: &str, allowed: &[&'a str]) -> ModuleResult<&'a str> {
    let mut lines = stdout.lines();
    let first = lines.next().unwrap_or("").trim_end();
    let answer = allowed
        .iter()
        .find(|a| **a == first)
        .copied()
        .ok_or_else(|| {
            ModuleError::Protocol(format!(
                "unexpected answer {first:?}, wanted one of {allowed:?}"
            ))
        })?;
    let rest: String = lines.collect::<Vec<_>>().join("\n");
    if !rest.trim().is_empty() {
        return Err(ModuleError::Protocol(format!(
            "trailing output after answer: {:?}",
            rest.trim()
        )));
    }
    Ok(answer)
}

fn make_fifo(path: &Path) -> ModuleResult<()> {
    let _ = fs::remove_file(path);
    mkfifo(path, Mode::from_bits_truncate(0o600))
        .with_context(|| format!("failed to create fifo {}", path.display()))
        .map_err(ModuleError::Other)
}

enum StreamAbort {
    /// Fall through to file mode (module never consumed the protocol).
    FileMode,
    Fail(ModuleError),
}

impl From<ModuleError> for StreamAbort {
    fn from(e: ModuleError) -> Self {
        StreamAbort::Fail(e)
    }
}

enum FifoWriter {
    Opened(File),
    /// The module exited before a reader showed up.
    ChildExited,
}

/// Open the write end of a FIFO without blocking forever: poll with
/// O_NONBLOCK until the module opens the read end, the module exits, or
/// the deadline passes.
fn open_fifo_writer(
    path: &Path,
    deadline: Instant,
    child: &mut Child,
) -> Result<FifoWriter, ModuleError> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)
        {
            Ok(f) => return Ok(FifoWriter::Opened(f)),
            Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                if child
                    .try_wait()
                    .context("failed to poll update module")
                    .map_err(ModuleError::Other)?
                    .is_some()
                {
                    return Ok(FifoWriter::ChildExited);
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ModuleError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(ModuleError::Other(
                    anyhow::Error::new(e).context(format!("failed to open fifo {}", path.display())),
                ));
            }
        }
    }
}

enum WriteFail {
    /// Reader closed its end.
    Closed,
    Timeout,
    Io(anyhow::Error),
}

fn write_all_fifo(
    writer: &mut File,
    bytes: &[u8],
    deadline: Instant,
    child: &mut Child,
) -> Result<(), WriteFail> {
    let mut offset = 0;
    while offset < bytes.len() {
        match writer.write(&bytes[offset..]) {
            Ok(0) => return Err(WriteFail::Closed),
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // The module stopped draining; give it time, but not past
                // the invocation deadline, and notice if it died.
                match child.try_wait() {
                    Ok(Some(_)) => return Err(WriteFail::Closed),
                    Ok(None) => {}
                    Err(e) => return Err(WriteFail::Io(e.into())),
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(WriteFail::Timeout);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Err(WriteFail::Closed),
            Err(e) => return Err(WriteFail::Io(e.into())),
        }
    }
    Ok(())
}

fn write_line(path: &Path, value: &str) -> ModuleResult<()> {
    fs::write(path, format!("{value}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(ModuleError::Other)
}

fn write_json(path: &Path, value: &serde_json::Value) -> ModuleResult<()> {
    let data = serde_json::to_vec_pretty(value)
        .context("failed to serialize module header JSON")
        .map_err(ModuleError::Other)?;
    fs::write(path, data)
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(ModuleError::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Deployment;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    struct NullReporter;

    impl Reporter for NullReporter {
        fn info(&mut self, _msg: &str) {}
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, _msg: &str) {}
    }

    fn write_module(dir: &Path, payload_type: &str, body: &str) {
        let path = dir.join(payload_type);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
    }

    fn runner(modules: &Path, tree: &Path) -> ModuleRunner {
        ModuleRunner::new(
            modules,
            "rootfs-image",
            tree.to_path_buf(),
            Duration::from_secs(10),
        )
        .expect("runner")
    }

    fn update_info() -> UpdateInfo {
        UpdateInfo::new(Deployment {
            id: "d-1".into(),
            artifact_name: "release-2".into(),
            artifact_group: Some("stable".into()),
            payload_types: vec!["rootfs-image".into()],
            ..Default::default()
        })
    }

    #[test]
    fn missing_module_is_an_error() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        assert!(
            ModuleRunner::new(
                modules.path(),
                "no-such-type",
                tree.path().to_path_buf(),
                Duration::from_secs(1),
            )
            .is_err()
        );
    }

    #[test]
    fn prepare_tree_writes_the_contract() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        write_module(modules.path(), "rootfs-image", "exit 0");

        let r = runner(modules.path(), tree.path());
        r.prepare_tree(&update_info(), "raspberrypi4", "release-1", "stable")
            .expect("prepare");

        let read = |p: &str| std::fs::read_to_string(tree.path().join(p)).expect("read");
        assert_eq!(read("version"), "3\n");
        assert_eq!(read("current_artifact_name"), "release-1\n");
        assert_eq!(read("current_device_type"), "raspberrypi4\n");
        assert_eq!(read("header/artifact_name"), "release-2\n");
        assert_eq!(read("header/payload_type"), "rootfs-image\n");
        assert!(tree.path().join("tmp").is_dir());

        let header_info: serde_json::Value =
            serde_json::from_str(&read("header/header-info")).expect("json");
        assert_eq!(header_info["payloads"][0]["type"], "rootfs-image");
        let meta: serde_json::Value = serde_json::from_str(&read("header/meta-data")).expect("json");
        assert!(meta.is_null());
    }

    #[test]
    fn query_answers_are_validated() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        let mut rep = NullReporter;

        write_module(modules.path(), "rootfs-image", "echo Yes");
        assert!(runner(modules.path(), tree.path()).supports_rollback(&mut rep).expect("query"));

        write_module(modules.path(), "rootfs-image", "echo No");
        assert!(!runner(modules.path(), tree.path()).supports_rollback(&mut rep).expect("query"));

        write_module(modules.path(), "rootfs-image", "echo Maybe");
        match runner(modules.path(), tree.path()).supports_rollback(&mut rep) {
            Err(ModuleError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }

        write_module(modules.path(), "rootfs-image", "echo Yes; echo garbage");
        match runner(modules.path(), tree.path()).supports_rollback(&mut rep) {
            Err(ModuleError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }

        write_module(modules.path(), "rootfs-image", "echo Automatic");
        assert_eq!(
            runner(modules.path(), tree.path()).needs_reboot(&mut rep).expect("query"),
            RebootRequest::Automatic
        );
    }

    #[test]
    fn nonzero_exit_is_reported_with_code() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        write_module(modules.path(), "rootfs-image", "echo doom >&2; exit 7");
        let mut rep = NullReporter;
        match runner(modules.path(), tree.path()).call(ModuleState::ArtifactInstall, &mut rep) {
            Err(ModuleError::Exit { code: 7, stderr }) => assert!(stderr.contains("doom")),
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[test]
    fn hung_module_times_out() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        write_module(modules.path(), "rootfs-image", "sleep 60");
        let r = ModuleRunner::new(
            modules.path(),
            "rootfs-image",
            tree.path().to_path_buf(),
            Duration::from_millis(300),
        )
        .expect("runner");
        let mut rep = NullReporter;
        match r.call(ModuleState::ArtifactCommit, &mut rep) {
            Err(ModuleError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn download_streams_payloads_through_fifos() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        let payload_dir = tempdir().expect("tempdir");

        write_module(
            modules.path(),
            "rootfs-image",
            r#"while :; do
  name=$(cat stream-next)
  [ -z "$name" ] && break
  cat "$name" >> streamed.out
done"#,
        );

        let payload_path = payload_dir.path().join("p1.bin");
        std::fs::write(&payload_path, b"payload-bytes-here").expect("write");

        let r = runner(modules.path(), tree.path());
        let mut rep = NullReporter;
        r.download(
            &[PayloadFile {
                name: "p1.bin".into(),
                path: payload_path,
            }],
            &mut rep,
        )
        .expect("download");

        let streamed = std::fs::read(tree.path().join("streamed.out")).expect("read");
        assert_eq!(streamed, b"payload-bytes-here");
    }

    #[test]
    fn module_ignoring_streams_falls_back_to_files() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        let payload_dir = tempdir().expect("tempdir");

        // Never touches the protocol; expects files/ to be populated.
        write_module(modules.path(), "rootfs-image", "exit 0");

        let payload_path = payload_dir.path().join("p1.bin");
        std::fs::write(&payload_path, b"fallback-bytes").expect("write");

        let r = runner(modules.path(), tree.path());
        let mut rep = NullReporter;
        r.download(
            &[PayloadFile {
                name: "p1.bin".into(),
                path: payload_path,
            }],
            &mut rep,
        )
        .expect("download");

        let on_disk = std::fs::read(tree.path().join("files/p1.bin")).expect("read");
        assert_eq!(on_disk, b"fallback-bytes");
        // FIFO plumbing is gone in file mode.
        assert!(!tree.path().join("stream-next").exists());
    }

    #[test]
    fn short_stream_read_is_a_broken_pipe() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        let payload_dir = tempdir().expect("tempdir");

        // Reads the entry, consumes one byte of the stream, then quits.
        write_module(
            modules.path(),
            "rootfs-image",
            r#"name=$(cat stream-next)
head -c1 "$name" > /dev/null
exit 0"#,
        );

        let payload_path = payload_dir.path().join("p1.bin");
        std::fs::write(&payload_path, vec![7u8; 256 * 1024]).expect("write");

        let r = runner(modules.path(), tree.path());
        let mut rep = NullReporter;
        match r.download(
            &[PayloadFile {
                name: "p1.bin".into(),
                path: payload_path,
            }],
            &mut rep,
        ) {
            Err(ModuleError::BrokenPipe(name)) => assert_eq!(name, "p1.bin"),
            other => panic!("expected broken pipe, got {other:?}"),
        }
    }

    #[test]
    fn failing_download_module_surfaces_exit_code() {
        let modules = tempdir().expect("tempdir");
        let tree = tempdir().expect("tempdir");
        let payload_dir = tempdir().expect("tempdir");

        write_module(modules.path(), "rootfs-image", "exit 2");

        let payload_path = payload_dir.path().join("p1.bin");
        std::fs::write(&payload_path, b"x").expect("write");

        let r = runner(modules.path(), tree.path());
        let mut rep = NullReporter;
        match r.download(
            &[PayloadFile {
                name: "p1.bin".into(),
                path: payload_path,
            }],
            &mut rep,
        ) {
            Err(ModuleError::Exit { code: 2, .. }) => {}
            other => panic!("expected exit error, got {other:?}"),
        }
    }
}
