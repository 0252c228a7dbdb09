//! Per-playlist sync state.

use std::fmt;

/// Where a playlist is in its sync pass.
///
/// `Idle -> Fetching -> Diffing -> Downloading -> Reporting -> Idle`; a
/// fetch failure goes straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Diffing,
    Downloading,
    Reporting,
}

impl SyncState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Diffing => "diffing",
            Self::Downloading => "downloading",
            Self::Reporting => "reporting",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_advance_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Fetching)
                | (Self::Fetching, Self::Diffing | Self::Idle)
                | (Self::Diffing, Self::Downloading | Self::Idle)
                | (Self::Downloading, Self::Reporting | Self::Idle)
                | (Self::Reporting, Self::Idle)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
