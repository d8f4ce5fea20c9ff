//! Runs external converters as short-lived subprocesses: argv in, bounded
//! stdout/stderr out, forcible kill once the wall-clock timeout expires.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use shared::error::ProcessingError;

/// Upper bound kept per captured stream; the rest is drained and dropped so
/// the pipe never blocks the child.
const CAPTURE_CAP: usize = 256 * 1024;

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.contains(pattern)
    }
}

async fn drain_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = CAPTURE_CAP.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(_) => break,
        }
    }
    captured
}

/// Executes `binary` with `args`, no stdin, returning exit code and captured
/// output. A timeout kills the process tree and surfaces as a transient
/// failure so the caller's retry policy applies.
pub async fn run_command(
    binary: &str,
    args: &[String],
    context: &str,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessingError> {
    debug!(binary, context, ?args, "spawning subprocess");
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            ProcessingError::TransientExternal(format!("{context}: spawning {binary}: {err}"))
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        match stdout {
            Some(reader) => drain_capped(reader).await,
            None => Vec::new(),
        }
    });
    let stderr_task = tokio::spawn(async move {
        match stderr {
            Some(reader) => drain_capped(reader).await,
            None => Vec::new(),
        }
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            return Err(ProcessingError::TransientExternal(format!(
                "{context}: waiting on {binary}: {err}"
            )));
        }
        Err(_) => {
            warn!(binary, context, timeout_secs = timeout.as_secs(), "subprocess timed out");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ProcessingError::TransientExternal(format!(
                "{context}: {binary} timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let output = ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };
    debug!(
        binary,
        context,
        exit_code = output.exit_code,
        "subprocess finished"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_stdout() {
        let output = run_command(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            "test",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_stderr_and_failure() {
        let output = run_command(
            "sh",
            &["-c".to_string(), "echo oops >&2; exit 3".to_string()],
            "test",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert!(output.stderr_contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let err = run_command(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            "test",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_binary_is_transient() {
        let err = run_command(
            "definitely-not-a-binary",
            &[],
            "test",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
