//! Runs external downloader tools with a time budget.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument};

use super::BackendError;

/// Max characters of stderr kept in a [`BackendError::ProcessFailed`].
const STDERR_TAIL_CHARS: usize = 600;

/// An external program plus the time budget for one run.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    timeout: Duration,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the program to completion and returns its output.
    ///
    /// The child is killed when the time budget elapses or when the
    /// returned future is dropped (caller cancelled).
    ///
    /// # Errors
    ///
    /// - [`BackendError::Spawn`] when the program cannot be started
    /// - [`BackendError::Timeout`] when the budget elapses
    /// - [`BackendError::ProcessFailed`] on a non-zero exit, with the tail of stderr
    #[instrument(skip(self, args), fields(program = %self.program))]
    pub async fn run(
        &self,
        backend: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<Output, BackendError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| BackendError::spawn(backend, &self.program, e))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| BackendError::spawn(backend, &self.program, e))?,
            Err(_) => return Err(BackendError::timeout(backend, self.timeout)),
        };

        debug!(status = ?output.status.code(), "tool exited");
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::process_failed(
                backend,
                &self.program,
                output.status.code(),
                stderr_tail(&stderr),
            ));
        }
        Ok(output)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_CHARS * 2));
        let tail = stderr_tail(&long);
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("END"));
        assert_eq!(stderr_tail("  short \n"), "short");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let tool = ToolCommand::new("tracksync-no-such-tool", Duration::from_secs(5));
        let err = tool.run("yt-dlp", &[], None).await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_process_failed() {
        let tool = ToolCommand::new("sh", Duration::from_secs(5));
        let args = vec!["-c".to_string(), "echo 'HTTP Error 429' >&2; exit 3".to_string()];
        let err = tool.run("yt-dlp", &args, None).await.unwrap_err();
        match err {
            BackendError::ProcessFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_time_budget_kills_the_child() {
        let tool = ToolCommand::new("sleep", Duration::from_millis(100));
        let err = tool.run("spotdl", &["5".to_string()], None).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }
}
