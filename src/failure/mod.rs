//! User-facing summaries for terminal failures.
//!
//! Front-ends show these instead of raw error text: a short reason plus
//! the next action worth trying.

use std::fmt;

use crate::download::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureReason {
    ServiceUnavailable,
    RateLimited,
    NotFound,
    Corrupted,
    /// Local disk or database trouble.
    Storage,
}

impl FailureReason {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "service unavailable",
            Self::RateLimited => "rate-limited",
            Self::NotFound => "not found",
            Self::Corrupted => "corrupted",
            Self::Storage => "storage problem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NextAction {
    RetryLater,
    TryManualSelection,
    RestoreBackup,
    CheckDisk,
}

impl NextAction {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::RetryLater => "retry later",
            Self::TryManualSelection => "try manual selection",
            Self::RestoreBackup => "restore the latest backup",
            Self::CheckDisk => "check disk space and permissions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserFacingFailure {
    pub reason: FailureReason,
    pub next_action: NextAction,
}

impl UserFacingFailure {
    #[must_use]
    pub fn from_kind(kind: FailureKind) -> Self {
        let (reason, next_action) = match kind {
            FailureKind::TransientNetwork | FailureKind::AuthExpired => {
                (FailureReason::ServiceUnavailable, NextAction::RetryLater)
            }
            FailureKind::RateLimited => (FailureReason::RateLimited, NextAction::RetryLater),
            FailureKind::PermanentRejection => {
                (FailureReason::NotFound, NextAction::TryManualSelection)
            }
            FailureKind::AllBackendsExhausted => {
                (FailureReason::ServiceUnavailable, NextAction::TryManualSelection)
            }
            FailureKind::IntegrityDefect => (FailureReason::Corrupted, NextAction::TryManualSelection),
            FailureKind::StoreCorruption => (FailureReason::Storage, NextAction::RestoreBackup),
            FailureKind::Filesystem => (FailureReason::Storage, NextAction::CheckDisk),
        };
        Self {
            reason,
            next_action,
        }
    }
}

impl From<FailureKind> for UserFacingFailure {
    fn from(kind: FailureKind) -> Self {
        Self::from_kind(kind)
    }
}

impl fmt::Display for UserFacingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.reason.label(), self.next_action.label())
    }
}
