//! Whole-playlist verification and repair.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{IntegrityChecker, VerificationResult};
use crate::download::{AttemptOptions, Orchestrator, Outcome};
use crate::playlist::{Track, TrackStatus};
use crate::store::{PlaylistStore, StoreError};

/// Classification of every stored track of one playlist.
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub playlist_id: String,
    pub valid: usize,
    /// Tracks whose file exists but failed verification.
    pub corrupted: Vec<(Track, VerificationResult)>,
    /// Tracks with no file on disk.
    pub missing: Vec<Track>,
}

impl AuditReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.valid + self.corrupted.len() + self.missing.len()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty() && self.missing.is_empty()
    }
}

/// Counts from [`repair`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub removed_files: usize,
    pub redownloaded: usize,
    pub failed: usize,
}

/// Verifies every stored track of `playlist_id` and records the verdicts as
/// track statuses.
///
/// # Errors
///
/// Returns [`StoreError`] when the playlist is unknown or a status write fails.
#[instrument(skip(store, checker))]
pub async fn audit(
    store: &dyn PlaylistStore,
    checker: &IntegrityChecker,
    playlist_id: &str,
) -> Result<AuditReport, StoreError> {
    if store.load_playlist(playlist_id).await?.is_none() {
        return Err(StoreError::PlaylistNotFound(playlist_id.to_string()));
    }

    let mut report = AuditReport {
        playlist_id: playlist_id.to_string(),
        ..AuditReport::default()
    };
    for track in store.list_tracks(playlist_id).await? {
        let verdict = checker
            .verify(track.target_path(), track.duration_secs())
            .await;
        let status = match &verdict {
            VerificationResult::Ok => {
                report.valid += 1;
                TrackStatus::Downloaded
            }
            VerificationResult::Missing => {
                let status = if track.status() == TrackStatus::Downloaded {
                    TrackStatus::Missing
                } else {
                    track.status()
                };
                report.missing.push(track.clone());
                status
            }
            _ => {
                report.corrupted.push((track.clone(), verdict.clone()));
                TrackStatus::Corrupt
            }
        };
        if status != track.status() {
            store
                .update_track_status(playlist_id, track.id(), status)
                .await?;
        }
    }

    info!(
        playlist = playlist_id,
        valid = report.valid,
        corrupted = report.corrupted.len(),
        missing = report.missing.len(),
        "audit finished"
    );
    Ok(report)
}

/// Deletes corrupted files, then re-downloads corrupted and missing tracks
/// through the orchestrator.
#[instrument(skip_all, fields(playlist = %report.playlist_id))]
pub async fn repair(
    orchestrator: &Orchestrator,
    report: &AuditReport,
    cancel: &CancellationToken,
) -> RepairSummary {
    let mut summary = RepairSummary::default();

    for (track, verdict) in &report.corrupted {
        match tokio::fs::remove_file(track.target_path()).await {
            Ok(()) => summary.removed_files += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(track_id = %track.id(), verdict = %verdict, error = %e, "could not remove corrupted file");
            }
        }
    }

    let options = AttemptOptions::for_playlist(&report.playlist_id);
    let queue = report
        .corrupted
        .iter()
        .map(|(track, _)| track)
        .chain(report.missing.iter());
    for track in queue {
        if cancel.is_cancelled() {
            break;
        }
        match orchestrator.attempt(track, &options, cancel).await {
            Outcome::Success { .. } => summary.redownloaded += 1,
            Outcome::Failure { .. } => summary.failed += 1,
            Outcome::Cancelled => break,
        }
    }

    info!(
        removed = summary.removed_files,
        redownloaded = summary.redownloaded,
        failed = summary.failed,
        "repair finished"
    );
    summary
}
