//! Attempt bookkeeping and terminal outcomes for one orchestration call.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use super::FailureType;

/// What happened on one step of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Transient,
    RateLimited,
    AuthExpired,
    Permanent,
    /// The backend produced a file that failed verification.
    IntegrityDefect,
    /// Breaker open; the backend was not called.
    Skipped,
}

impl From<FailureType> for StepOutcome {
    fn from(failure: FailureType) -> Self {
        match failure {
            FailureType::Transient => Self::Transient,
            FailureType::RateLimited => Self::RateLimited,
            FailureType::AuthExpired => Self::AuthExpired,
            FailureType::Permanent => Self::Permanent,
        }
    }
}

/// One (backend, proxy, outcome) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptStep {
    pub backend: String,
    pub proxy: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptStep {
    pub fn new(backend: impl Into<String>, proxy: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            backend: backend.into(),
            proxy: proxy.into(),
            outcome,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Every step taken for one track, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    track_id: String,
    steps: Vec<AttemptStep>,
}

impl AttemptRecord {
    #[must_use]
    pub fn new(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: AttemptStep) {
        self.steps.push(step);
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn steps(&self) -> &[AttemptStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct backends that were actually called, in chain order.
    #[must_use]
    pub fn backends_tried(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            if step.outcome != StepOutcome::Skipped && !names.contains(&step.backend.as_str()) {
                names.push(&step.backend);
            }
        }
        names
    }

    pub(crate) fn has_integrity_defect_since(&self, from: usize) -> bool {
        self.steps
            .iter()
            .skip(from)
            .any(|s| s.outcome == StepOutcome::IntegrityDefect)
    }

    pub(crate) fn last_failure_since(&self, from: usize) -> Option<StepOutcome> {
        self.steps
            .iter()
            .skip(from)
            .rev()
            .map(|s| s.outcome)
            .find(|o| !matches!(o, StepOutcome::Success | StepOutcome::Skipped))
    }
}

/// Terminal failure classes a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientNetwork,
    RateLimited,
    AuthExpired,
    PermanentRejection,
    IntegrityDefect,
    AllBackendsExhausted,
    StoreCorruption,
    /// The target directory or file could not be written.
    Filesystem,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::AuthExpired => "auth_expired",
            Self::PermanentRejection => "permanent_rejection",
            Self::IntegrityDefect => "integrity_defect",
            Self::AllBackendsExhausted => "all_backends_exhausted",
            Self::StoreCorruption => "store_corruption",
            Self::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only thing an orchestration caller ever sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        path: PathBuf,
        /// Backend that produced the file; `None` when an existing verified
        /// file was reused.
        backend: Option<String>,
        record: AttemptRecord,
    },
    Failure {
        kind: FailureKind,
        detail: String,
        record: AttemptRecord,
    },
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Success { path, .. } => Some(path),
            _ => None,
        }
    }

    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn record(&self) -> Option<&AttemptRecord> {
        match self {
            Self::Success { record, .. } | Self::Failure { record, .. } => Some(record),
            Self::Cancelled => None,
        }
    }
}
