//! Structured results of sync passes.

use crate::download::FailureKind;

/// One track that could not be downloaded during a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFailureSummary {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub kind: FailureKind,
}

/// Result of syncing one playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub playlist_id: String,
    pub playlist_name: String,
    /// New upstream tracks now downloaded.
    pub added: usize,
    /// Tracks (new or re-queued) whose download failed.
    pub failed: usize,
    /// Known tracks whose lost file was downloaded again.
    pub redownloaded: usize,
    /// New tracks stored but not downloaded (auto-download off).
    pub pending: usize,
    /// Identifiers that disappeared upstream.
    pub removed: usize,
    pub unchanged: usize,
    /// Syncable playlists in the store.
    pub total_syncable: usize,
    /// Custom playlists left out of scheduled passes.
    pub total_custom_excluded: usize,
    pub failures: Vec<TrackFailureSummary>,
    /// The pass stopped early because it was cancelled.
    pub cancelled: bool,
}

/// Aggregate of a pass over every syncable playlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Playlists synced without error.
    pub synced: usize,
    /// Syncable playlists considered.
    pub total: usize,
    /// New tracks downloaded across all playlists.
    pub new_tracks: usize,
    /// Playlists whose sync failed.
    pub errors: usize,
}

/// Everything a scheduled pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub summary: PassSummary,
    pub reports: Vec<SyncReport>,
    /// `(playlist name, error)` for playlists that failed.
    pub errors: Vec<(String, String)>,
    pub total_custom_excluded: usize,
}
