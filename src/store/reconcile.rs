//! Filesystem reconciliation: the files on disk decide what counts as downloaded.

use tracing::{info, instrument};

use super::{PlaylistStore, StoreError};
use crate::playlist::TrackStatus;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Tracks checked.
    pub checked: usize,
    /// `Downloaded` tracks whose file is gone, now `Missing`.
    pub marked_missing: usize,
    /// Tracks whose file exists, now `Downloaded`.
    pub marked_downloaded: usize,
}

impl ReconcileSummary {
    #[must_use]
    pub fn changed(&self) -> usize {
        self.marked_missing + self.marked_downloaded
    }
}

/// Re-derives each track's status from the presence of its target file.
///
/// `Corrupt` and `Downloading` tracks are left alone: the first needs a repair
/// pass, the second belongs to an in-flight attempt.
///
/// # Errors
///
/// Returns [`StoreError`] when the playlist cannot be read or a status write fails.
#[instrument(skip(store))]
pub async fn reconcile_with_filesystem(
    store: &dyn PlaylistStore,
    playlist_id: &str,
) -> Result<ReconcileSummary, StoreError> {
    if store.load_playlist(playlist_id).await?.is_none() {
        return Err(StoreError::PlaylistNotFound(playlist_id.to_string()));
    }

    let mut summary = ReconcileSummary::default();
    for track in store.list_tracks(playlist_id).await? {
        summary.checked += 1;
        let present = tokio::fs::metadata(track.target_path())
            .await
            .is_ok_and(|meta| meta.is_file());

        let next = match (track.status(), present) {
            (TrackStatus::Downloaded, false) => Some(TrackStatus::Missing),
            (TrackStatus::Pending | TrackStatus::Failed | TrackStatus::Missing, true) => {
                Some(TrackStatus::Downloaded)
            }
            _ => None,
        };
        if let Some(status) = next {
            store
                .update_track_status(playlist_id, track.id(), status)
                .await?;
            if status == TrackStatus::Missing {
                summary.marked_missing += 1;
            } else {
                summary.marked_downloaded += 1;
            }
        }
    }

    if summary.changed() > 0 {
        info!(
            playlist = playlist_id,
            missing = summary.marked_missing,
            downloaded = summary.marked_downloaded,
            "reconciled track statuses with filesystem"
        );
    }
    Ok(summary)
}
