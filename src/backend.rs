//! Isolation backend trait and implementations.
//!
//! Two strategies share one interface: [`DockerBackend`] runs submissions in
//! resource-bounded containers, [`LocalBackend`] runs them as plain child
//! processes when the container runtime cannot be reached.

mod docker;
mod local;

pub use docker::DockerBackend;
pub use local::LocalBackend;

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::ExecError;
use crate::types::BackendKind;
use crate::workspace::ScratchWorkspace;

/// Output kept per stream when a backend is not told otherwise.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Output of a program that ran to completion with a zero exit status.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr (warnings and the like; the run still succeeded).
    pub stderr: String,
    /// Wall-clock time of the execution step only.
    pub runtime: Duration,
}

/// Trait for isolation backends.
///
/// A backend compiles (when needed) and runs the source staged in a
/// workspace. Program failures are reported through [`ExecError`] so the
/// orchestrator can tell them apart from infrastructure failures.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Which strategy this backend implements.
    fn kind(&self) -> BackendKind;

    /// Whether the backend can currently accept work.
    async fn is_available(&self) -> bool {
        true
    }

    /// Compile and run the staged source.
    async fn execute(&self, workspace: &ScratchWorkspace) -> Result<RunOutput, ExecError>;
}

/// Process output captured under a deadline.
#[derive(Debug)]
pub(crate) struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Spawn `cmd`, collect stdout and stderr, and kill it if `limit` expires.
///
/// Each stream keeps at most `output_limit + 1` bytes, so callers can still
/// tell that output was cut; the rest is read and discarded so the child
/// never blocks on a full pipe. The child is reaped on every path;
/// `kill_on_drop` covers a caller that abandons the future midway.
pub(crate) async fn capture(
    mut cmd: Command,
    limit: Duration,
    output_limit: usize,
) -> Result<Captured, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Unexpected(format!("Failed to spawn process: {e}")))?;

    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Unexpected("Failed to open stdout".into()))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Unexpected("Failed to open stderr".into()))?;

    // `child` is not moved into this future, so it can be killed on timeout.
    let keep = output_limit.saturating_add(1);
    let read_all = async {
        let (r1, r2) = tokio::join!(
            read_bounded(&mut child_stdout, keep),
            read_bounded(&mut child_stderr, keep),
        );
        let map = |e: std::io::Error| {
            ExecError::Unexpected(format!("Failed to read process output: {e}"))
        };
        Ok::<_, ExecError>((r1.map_err(map)?, r2.map_err(map)?))
    };

    let (stdout_buf, stderr_buf) = if let Ok(result) = tokio::time::timeout(limit, read_all).await
    {
        result?
    } else {
        let _ = child.kill().await;
        return Err(ExecError::Timeout {
            limit,
            elapsed: started.elapsed(),
        });
    };

    // Pipes are closed but the process may linger; the deadline still applies.
    let remaining = limit.saturating_sub(started.elapsed());
    let status = if let Ok(status) = tokio::time::timeout(remaining, child.wait()).await {
        status.map_err(|e| ExecError::Unexpected(format!("Failed to wait for process: {e}")))?
    } else {
        let _ = child.kill().await;
        return Err(ExecError::Timeout {
            limit,
            elapsed: started.elapsed(),
        });
    };

    Ok(Captured {
        status,
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        elapsed: started.elapsed(),
    })
}

/// Read `reader` to the end, keeping only the first `keep` bytes.
async fn read_bounded<R>(reader: &mut R, keep: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut *reader)
        .take(u64::try_from(keep).unwrap_or(u64::MAX))
        .read_to_end(&mut buf)
        .await?;
    tokio::io::copy(reader, &mut tokio::io::sink()).await?;
    Ok(buf)
}

/// Append `chunk` to `buf` without letting it grow past `keep` bytes.
pub(crate) fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8], keep: usize) {
    let room = keep.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Pick the most informative diagnostic text from a failed step.
pub(crate) fn diagnostics(stdout: &str, stderr: &str, fallback: impl FnOnce() -> String) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    fallback()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn capture_collects_both_streams() {
        let out = capture(sh("echo out; echo err >&2"), Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn capture_reports_exit_status() {
        let out = capture(sh("exit 3"), Duration::from_secs(5), 1024).await.unwrap();
        assert_eq!(out.status.code(), Some(3));
    }

    #[tokio::test]
    async fn capture_kills_on_timeout() {
        let limit = Duration::from_millis(300);
        let err = capture(sh("sleep 30"), limit, 1024).await.unwrap_err();
        match err {
            ExecError::Timeout { elapsed, .. } => {
                assert!(elapsed >= limit);
                assert!(elapsed < Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_missing_program_is_unexpected() {
        let cmd = Command::new("/nonexistent/definitely-not-here");
        let err = capture(cmd, Duration::from_secs(1), 1024).await.unwrap_err();
        assert!(matches!(err, ExecError::Unexpected(_)));
    }

    #[tokio::test]
    async fn capture_bounds_large_output() {
        let out = capture(
            sh("head -c 5000000 /dev/zero; head -c 3000000 /dev/zero >&2; echo done >&2"),
            Duration::from_secs(10),
            1024,
        )
        .await
        .unwrap();
        // The writer still runs to completion; only the kept prefix is stored.
        assert!(out.status.success());
        assert_eq!(out.stdout.len(), 1025);
        assert_eq!(out.stderr.len(), 1025);
    }

    #[test]
    fn append_bounded_stops_at_limit() {
        let mut buf = Vec::new();
        append_bounded(&mut buf, b"abcdef", 4);
        assert_eq!(buf, b"abcd");
        append_bounded(&mut buf, b"xyz", 4);
        assert_eq!(buf, b"abcd");

        let mut buf = b"a".to_vec();
        append_bounded(&mut buf, b"bc", 10);
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn diagnostics_prefers_stderr() {
        assert_eq!(diagnostics("o", " e \n", || "f".into()), "e");
        assert_eq!(diagnostics("o", "", || "f".into()), "o");
        assert_eq!(diagnostics(" ", "", || "f".into()), "f");
    }
}
