//! Optional duration probing through an external decoder.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Time budget for one probe run.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes allowed to run at once.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 2;

/// Reports the playable duration of an audio file.
///
/// `None` means "unknown" (tool missing, unreadable output, timeout); the
/// duration check is then skipped rather than failed.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_secs(&self, path: &Path) -> Option<f64>;
}

/// `ffprobe -v quiet -show_entries format=duration -of csv=p=0 <file>`,
/// bounded by a semaphore so probing never starves the download pool.
#[derive(Debug)]
pub struct FfprobeProbe {
    program: String,
    timeout: Duration,
    permits: Arc<Semaphore>,
    missing: AtomicBool,
}

impl FfprobeProbe {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: PROBE_TIMEOUT,
            permits: Arc::new(Semaphore::new(DEFAULT_PROBE_CONCURRENCY)),
            missing: AtomicBool::new(false),
        }
    }

    /// Uses `FFPROBE_PATH` when set, else `ffprobe` from `PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()))
    }

    #[must_use]
    pub fn with_concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn duration_secs(&self, path: &Path) -> Option<f64> {
        if self.missing.load(Ordering::Relaxed) {
            return None;
        }
        let _permit = self.permits.acquire().await.ok()?;

        let child = Command::new(&self.program)
            .args(["-v", "quiet", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(program = %self.program, "duration probe not installed; skipping duration checks");
                self.missing.store(true, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                debug!(error = %e, "duration probe failed to start");
                return None;
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(status = ?output.status.code(), "duration probe rejected file");
                return None;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "duration probe failed");
                return None;
            }
            Err(_) => {
                debug!(path = %path.display(), "duration probe timed out");
                return None;
            }
        };
        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses ffprobe's `csv=p=0` duration line (`"207.346122"`).
#[must_use]
pub fn parse_duration_output(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Probe that always answers with the same duration. Handy for tests and
/// for callers that already know the duration.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub Option<f64>);

#[async_trait]
impl DurationProbe for FixedProbe {
    async fn duration_secs(&self, _path: &Path) -> Option<f64> {
        self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_output() {
        assert_eq!(parse_duration_output("207.346122\n"), Some(207.346_122));
        assert_eq!(parse_duration_output("\n  12\n"), Some(12.0));
        assert_eq!(parse_duration_output("N/A"), None);
        assert_eq!(parse_duration_output(""), None);
        assert_eq!(parse_duration_output("-3"), None);
    }

    #[tokio::test]
    async fn test_missing_program_degrades_to_unknown() {
        let probe = FfprobeProbe::new("tracksync-no-such-ffprobe");
        assert_eq!(probe.duration_secs(Path::new("/nonexistent.mp3")).await, None);
        // remembered, no second spawn attempt
        assert!(probe.missing.load(Ordering::Relaxed));
        assert_eq!(probe.duration_secs(Path::new("/nonexistent.mp3")).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_stdout_of_probe_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-ffprobe");
        std::fs::write(&script, "#!/bin/sh\necho 207.5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = FfprobeProbe::new(script.to_string_lossy()).with_concurrency(1);
        assert_eq!(probe.duration_secs(Path::new("/any.mp3")).await, Some(207.5));
    }
}
