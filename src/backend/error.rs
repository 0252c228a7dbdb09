//! Error type shared by all backend adapters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::{DownloadError, FailureType, Retryable};

/// A single backend's failure to produce a file for a track.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot handle this track at all.
    #[error("{backend} does not support this track: {reason}")]
    Unsupported {
        /// Backend name.
        backend: String,
        /// Why (e.g. "no YouTube candidate").
        reason: String,
    },

    /// An HTTP call failed.
    #[error("{backend}: {source}")]
    Http {
        /// Backend name.
        backend: String,
        /// The underlying fetch error.
        #[source]
        source: DownloadError,
    },

    /// The service says the track does not exist or cannot be converted.
    #[error("{backend} rejected the track: {reason}")]
    Rejected {
        /// Backend name.
        backend: String,
        /// Service-provided reason.
        reason: String,
    },

    /// The service answered but is temporarily unable to serve the track.
    #[error("{backend} unavailable: {reason}")]
    Unavailable {
        /// Backend name.
        backend: String,
        /// Service-provided reason.
        reason: String,
    },

    /// The service could not hand out a session token.
    #[error("{backend} authentication failed: {reason}")]
    Auth {
        /// Backend name.
        backend: String,
        /// What went wrong.
        reason: String,
    },

    /// An external tool could not be started.
    #[error("{backend}: failed to run {program}: {source}")]
    Spawn {
        /// Backend name.
        backend: String,
        /// Program that failed to start.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited unsuccessfully.
    #[error("{backend}: {program} exited with {code:?}: {stderr}")]
    ProcessFailed {
        /// Backend name.
        backend: String,
        /// Program that ran.
        program: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Tail of stderr.
        stderr: String,
    },

    /// An external tool ran past its time budget.
    #[error("{backend} timed out after {after:?}")]
    Timeout {
        /// Backend name.
        backend: String,
        /// Time budget that elapsed.
        after: Duration,
    },

    /// The backend reported success but left no file behind.
    #[error("{backend} produced no output file")]
    NoOutput {
        /// Backend name.
        backend: String,
    },

    /// Local file handling failed.
    #[error("{backend}: IO error at {path}: {source}")]
    Io {
        /// Backend name.
        backend: String,
        /// Path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn unsupported(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn http(backend: impl Into<String>, source: DownloadError) -> Self {
        Self::Http {
            backend: backend.into(),
            source,
        }
    }

    pub fn rejected(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn auth(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Auth {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn spawn(
        backend: impl Into<String>,
        program: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Spawn {
            backend: backend.into(),
            program: program.into(),
            source,
        }
    }

    pub fn process_failed(
        backend: impl Into<String>,
        program: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ProcessFailed {
            backend: backend.into(),
            program: program.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn timeout(backend: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            backend: backend.into(),
            after,
        }
    }

    pub fn no_output(backend: impl Into<String>) -> Self {
        Self::NoOutput {
            backend: backend.into(),
        }
    }

    pub fn io(backend: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            backend: backend.into(),
            path: path.into(),
            source,
        }
    }

    /// Name of the backend that failed.
    #[must_use]
    pub fn backend(&self) -> &str {
        match self {
            Self::Unsupported { backend, .. }
            | Self::Http { backend, .. }
            | Self::Rejected { backend, .. }
            | Self::Unavailable { backend, .. }
            | Self::Auth { backend, .. }
            | Self::Spawn { backend, .. }
            | Self::ProcessFailed { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::NoOutput { backend }
            | Self::Io { backend, .. } => backend,
        }
    }
}

impl Retryable for BackendError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Http { source, .. } => source.failure_type(),
            Self::Auth { .. } => FailureType::AuthExpired,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::NoOutput { .. } => {
                FailureType::Transient
            }
            Self::ProcessFailed { stderr, .. } => classify_tool_stderr(stderr),
            Self::Unsupported { .. }
            | Self::Rejected { .. }
            | Self::Spawn { .. }
            | Self::Io { .. } => FailureType::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { source, .. } => Retryable::retry_after(source),
            _ => None,
        }
    }
}

/// Classifies a downloader tool's stderr.
fn classify_tool_stderr(stderr: &str) -> FailureType {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
    {
        FailureType::RateLimited
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("no results")
        || lower.contains("not found")
        || lower.contains("unsupported url")
    {
        FailureType::Permanent
    } else {
        FailureType::Transient
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_by_variant() {
        assert_eq!(
            BackendError::auth("ezconv", "token rejected").failure_type(),
            FailureType::AuthExpired
        );
        assert_eq!(
            BackendError::rejected("pullmp3", "bad id").failure_type(),
            FailureType::Permanent
        );
        assert_eq!(
            BackendError::unavailable("ezconv", "processing").failure_type(),
            FailureType::Transient
        );
        assert_eq!(
            BackendError::http("spotdown", DownloadError::http_status("https://x", 429))
                .failure_type(),
            FailureType::RateLimited
        );
    }

    #[test]
    fn test_tool_stderr_classification() {
        assert_eq!(
            classify_tool_stderr("ERROR: HTTP Error 429: Too Many Requests"),
            FailureType::RateLimited
        );
        assert_eq!(
            classify_tool_stderr("ERROR: [youtube] abc: Video unavailable"),
            FailureType::Permanent
        );
        assert_eq!(
            classify_tool_stderr("ERROR: unable to download webpage: connection reset"),
            FailureType::Transient
        );
    }

    #[test]
    fn test_backend_accessor() {
        assert_eq!(BackendError::no_output("yt-dlp").backend(), "yt-dlp");
    }
}
