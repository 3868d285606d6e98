//! External command execution with captured output and bounded runtime.
//!
//! Every invocation returns a structured outcome: non-zero exits, spawn
//! failures and timeouts all become `success = false` with the best
//! available output. A timeout is a definite failure, never "unknown".

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Raw capture with the streams kept apart, for callers that parse stdout.
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl RawOutcome {
    fn failed(message: String, duration: Duration, timed_out: bool) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message,
            duration,
            timed_out,
        }
    }

    /// Combined stdout + stderr, stdout first.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs a prepared command to completion under a wall-clock limit, capturing
/// both streams. The child is killed on timeout.
pub async fn run_command(mut command: Command, limit: Duration) -> RawOutcome {
    let start = Instant::now();
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return RawOutcome::failed(format!("failed to spawn: {}", e), start.elapsed(), false)
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let bounded = tokio::time::timeout(limit, async {
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let _ = tokio::join!(
            async {
                if let Some(ref mut s) = stdout {
                    let _ = s.read_to_end(&mut out_buf).await;
                }
            },
            async {
                if let Some(ref mut s) = stderr {
                    let _ = s.read_to_end(&mut err_buf).await;
                }
            }
        );
        let status = child.wait().await;
        (out_buf, err_buf, status)
    })
    .await;

    match bounded {
        Ok((out_buf, err_buf, status)) => {
            let success = status.map(|s| s.success()).unwrap_or(false);
            RawOutcome {
                success,
                stdout: String::from_utf8_lossy(&out_buf).to_string(),
                stderr: String::from_utf8_lossy(&err_buf).to_string(),
                duration: start.elapsed(),
                timed_out: false,
            }
        }
        Err(_) => {
            let _ = child.kill().await;
            RawOutcome::failed(
                format!("timed out after {:?}", limit),
                start.elapsed(),
                true,
            )
        }
    }
}

/// Runs a shell command line in the given directory, returning the combined
/// output. This is the call shape the build/test/docker verifiers use.
pub async fn run_shell(command_line: &str, dir: &Path, limit: Duration) -> CommandOutcome {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line).current_dir(dir);
    let raw = run_command(command, limit).await;
    CommandOutcome {
        success: raw.success,
        output: raw.combined(),
        duration: raw.duration,
        timed_out: raw.timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_successful_command_captures_output() {
        let dir = tempdir().unwrap();
        let outcome = run_shell("echo hello", dir.path(), Duration::from_secs(5)).await;
        assert!(outcome.success);
        assert!(!outcome.timed_out);
        assert!(outcome.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_not_error() {
        let dir = tempdir().unwrap();
        let outcome = run_shell("echo boom >&2; exit 3", dir.path(), Duration::from_secs(5)).await;
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_is_definite_failure() {
        let dir = tempdir().unwrap();
        let outcome = run_shell("sleep 30", dir.path(), Duration::from_millis(100)).await;
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_captured() {
        let command = Command::new("/nonexistent/binary-for-test");
        let raw = run_command(command, Duration::from_secs(5)).await;
        assert!(!raw.success);
        assert!(raw.stderr.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_combined_interleaves_streams_stdout_first() {
        let dir = tempdir().unwrap();
        let outcome = run_shell("echo out; echo err >&2", dir.path(), Duration::from_secs(5)).await;
        assert!(outcome.success);
        let out_pos = outcome.output.find("out").unwrap();
        let err_pos = outcome.output.find("err").unwrap();
        assert!(out_pos < err_pos);
    }
}
