use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Result of a subprocess execution with timeout bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) exit_code: i32,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) timed_out: bool,
    pub(crate) duration: Duration,
}

/// Run a command to completion, killing it when `timeout` elapses.
pub(crate) fn run_command_with_timeout(
    program: &Path,
    args: &[&str],
    working_dir: &Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll {}", program.display()))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        program.display(),
                        humantime::format_duration(timeout)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }

                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Wait for an already-spawned child, killing it when `deadline` passes.
pub(crate) fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
    label: &str,
) -> Result<CommandOutput> {
    let start = Instant::now();
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll {label}"))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr: read_pipe(child.stderr.take()),
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[test]
    fn captures_exit_code_and_output() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(dir.path(), "ok.sh", "echo out; echo err >&2; exit 3");
        let out = run_command_with_timeout(&script, &[], dir.path(), Duration::from_secs(5))
            .expect("run");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(dir.path(), "hang.sh", "sleep 30");
        let out = run_command_with_timeout(&script, &[], dir.path(), Duration::from_millis(200))
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
        assert!(out.duration < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("no-such-program");
        assert!(
            run_command_with_timeout(&missing, &[], dir.path(), Duration::from_secs(1)).is_err()
        );
    }
}
