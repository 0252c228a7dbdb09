//! Playlist and track data model.
//!
//! - [`Playlist`] - a named folder of uniquely-identified tracks
//! - [`Track`] - an immutable track reference with a mutable [`TrackStatus`]
//! - [`SyncDelta`] - set difference between a stored playlist and its upstream

mod delta;
mod track;

pub use delta::{RemovedTrackPolicy, SyncDelta};
pub use track::{
    SourceCandidate, Track, TrackStatus, parse_duration_label, sanitize_component,
    track_file_name,
};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

/// A stored playlist.
///
/// Track identifiers are unique; [`Playlist::add_track`] is a no-op for an
/// identifier that is already present.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    id: String,
    name: String,
    folder: PathBuf,
    source_url: Option<String>,
    syncable: bool,
    last_synced_at: Option<DateTime<Utc>>,
    tracks: Vec<Track>,
}

impl Playlist {
    /// Creates a syncable playlist mirrored from `source_url`.
    #[must_use]
    pub fn syncable(
        id: impl Into<String>,
        name: impl Into<String>,
        folder: impl Into<PathBuf>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: folder.into(),
            source_url: Some(source_url.into()),
            syncable: true,
            last_synced_at: None,
            tracks: Vec::new(),
        }
    }

    /// Creates a locally-curated playlist that scheduled sync never touches.
    #[must_use]
    pub fn custom(id: impl Into<String>, name: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: folder.into(),
            source_url: None,
            syncable: false,
            last_synced_at: None,
            tracks: Vec::new(),
        }
    }

    /// Rebuilds a playlist from stored columns.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: String,
        name: String,
        folder: PathBuf,
        source_url: Option<String>,
        syncable: bool,
        last_synced_at: Option<DateTime<Utc>>,
        tracks: Vec<Track>,
    ) -> Self {
        let mut playlist = Self {
            id,
            name,
            folder,
            source_url,
            syncable,
            last_synced_at,
            tracks: Vec::with_capacity(tracks.len()),
        };
        for track in tracks {
            playlist.add_track(track);
        }
        playlist
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage folder for this playlist's files.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    #[must_use]
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Whether scheduled sync may reconcile this playlist.
    #[must_use]
    pub fn is_syncable(&self) -> bool {
        self.syncable && self.source_url.is_some()
    }

    #[must_use]
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Records a completed sync pass.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    #[must_use]
    pub fn track(&self, track_id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == track_id)
    }

    pub fn track_mut(&mut self, track_id: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == track_id)
    }

    /// Set of track identifiers currently stored.
    #[must_use]
    pub fn track_ids(&self) -> HashSet<&str> {
        self.tracks.iter().map(Track::id).collect()
    }

    /// Adds a track. Returns `false` (and changes nothing) for a duplicate id.
    pub fn add_track(&mut self, track: Track) -> bool {
        if self.contains(track.id()) {
            debug!(playlist = %self.id, track_id = %track.id(), "skipping duplicate track");
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Removes a track by id.
    pub fn remove_track(&mut self, track_id: &str) -> Option<Track> {
        let index = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(index))
    }

    /// Builds a track targeted at this playlist's folder.
    #[must_use]
    pub fn new_track(
        &self,
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Track {
        Track::in_folder(id, title, artist, &self.folder)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_add_track_rejects_duplicate_identifier() {
        let mut playlist = Playlist::custom("mix", "Mix", "/music/Mix");
        let track = playlist.new_track("id-1", "Song", "Artist");
        assert!(playlist.add_track(track.clone()));
        assert!(!playlist.add_track(track));
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn test_from_parts_collapses_duplicates() {
        let a = Track::new("a", "A", "X", "/a.mp3");
        let b = Track::new("b", "B", "X", "/b.mp3");
        let playlist = Playlist::from_parts(
            "p".into(),
            "P".into(),
            "/m".into(),
            None,
            false,
            None,
            vec![a.clone(), b, a],
        );
        assert_eq!(playlist.len(), 2);
        assert_eq!(playlist.tracks()[0].id(), "a");
    }

    #[test]
    fn test_custom_playlist_is_not_syncable() {
        let playlist = Playlist::custom("c", "C", "/m/C");
        assert!(!playlist.is_syncable());
        let synced = Playlist::syncable("s", "S", "/m/S", "https://open.spotify.com/playlist/x");
        assert!(synced.is_syncable());
    }

    #[test]
    fn test_remove_track() {
        let mut playlist = Playlist::custom("c", "C", "/m/C");
        playlist.add_track(playlist.new_track("x", "T", "A"));
        assert!(playlist.remove_track("x").is_some());
        assert!(playlist.remove_track("x").is_none());
        assert!(playlist.is_empty());
    }
}
