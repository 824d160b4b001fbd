//! Bounded subprocess execution for the external rendering tools.
//!
//! Commands are always argument vectors, never shell strings, and every
//! invocation carries an explicit deadline. The child is spawned with
//! `kill_on_drop` so an expired deadline forcibly terminates it instead of
//! leaking a runaway renderer.

use std::{io, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {exit_code:?}: {stderr}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("`{program}` timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("i/o error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Run a command to completion within `timeout`, discarding stdout.
pub async fn run(command: Command, timeout: Duration) -> Result<(), ProcessError> {
    run_inner(command, timeout, false).await.map(|_| ())
}

/// Run a command to completion within `timeout`, returning captured stdout.
pub async fn run_with_stdout(command: Command, timeout: Duration) -> Result<String, ProcessError> {
    run_inner(command, timeout, true).await
}

async fn run_inner(
    mut command: Command,
    timeout: Duration,
    capture_stdout: bool,
) -> Result<String, ProcessError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Dropping the in-flight future on timeout drops the child handle, which
    // kills the process thanks to kill_on_drop.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?,
        Err(_) => return Err(ProcessError::TimedOut { program, timeout }),
    };

    if !output.status.success() {
        return Err(ProcessError::Failed {
            program,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

    use tempfile::TempDir;
    use tokio::process::Command;

    use super::*;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "ok", "#!/bin/sh\necho \"pages 7\"\n");

        let stdout = run_with_stdout(Command::new(&script), Duration::from_secs(5))
            .await
            .expect("run");
        assert_eq!(stdout.trim(), "pages 7");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_code_and_stderr() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "boom", "#!/bin/sh\necho \"bad xref\" >&2\nexit 3\n");

        let err = run(Command::new(&script), Duration::from_secs(5))
            .await
            .expect_err("expected failure");
        match err {
            ProcessError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("bad xref"), "stderr lost: {stderr}");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_expiry_reports_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "slow", "#!/bin/sh\nsleep 5\n");

        let err = run(Command::new(&script), Duration::from_millis(100))
            .await
            .expect_err("expected timeout");
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let err = run(
            Command::new("/nonexistent/platemark-renderer"),
            Duration::from_secs(1),
        )
        .await
        .expect_err("expected spawn failure");
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
