//! Playlist persistence.
//!
//! - [`PlaylistStore`] - the persistence seam used by the orchestrator and sync engine
//! - [`SqliteStore`] - the `SQLite` implementation over [`Database`]
//! - [`reconcile_with_filesystem`] - brings stored statuses back in line with the disk
//!
//! Writes to one playlist are serialized (single writer per playlist);
//! reads never wait. Once a write reports corruption the store refuses all
//! further writes until the database is restored and reopened.

mod error;
mod reconcile;

pub use error::{StoreDbErrorKind, StoreError};
pub use reconcile::{ReconcileSummary, reconcile_with_filesystem};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::FromRow;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::db::Database;
use crate::download::AttemptStep;
use crate::playlist::{Playlist, SourceCandidate, Track, TrackStatus};

/// Terminal outcome kinds written to the download log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Success,
    Failure,
    Cancelled,
}

impl LogOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One download-log row to insert.
#[derive(Debug, Clone)]
pub struct DownloadLogEntry<'a> {
    pub playlist_id: Option<&'a str>,
    pub track_id: &'a str,
    pub outcome: LogOutcome,
    pub failure_kind: Option<&'a str>,
    /// Backend that produced the file, on success.
    pub backend: Option<&'a str>,
    pub file_path: Option<&'a Path>,
    pub attempts: &'a [AttemptStep],
}

/// A stored download-log row.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadLogRow {
    pub id: i64,
    pub playlist_id: Option<String>,
    pub track_id: String,
    pub outcome: String,
    pub failure_kind: Option<String>,
    pub backend: Option<String>,
    pub file_path: Option<String>,
    /// JSON array of attempt steps.
    pub attempts: String,
    pub created_at: String,
}

/// What happens to audio files when their playlist is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Only the database records go.
    #[default]
    KeepFiles,
    /// Track files are removed as well.
    DeleteFiles,
}

/// Persistence operations the core relies on. Each call is atomic.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn load_playlists(&self) -> Result<Vec<Playlist>, StoreError>;

    async fn load_playlist(&self, playlist_id: &str) -> Result<Option<Playlist>, StoreError>;

    async fn find_playlist_by_name(&self, name: &str) -> Result<Option<Playlist>, StoreError>;

    /// Upserts the playlist and makes its stored track set equal to
    /// `playlist.tracks()` (duplicates collapsed, first wins).
    async fn save_playlist(&self, playlist: &Playlist) -> Result<(), StoreError>;

    /// Appends tracks the playlist does not hold yet. Stored rows are left
    /// untouched, so concurrent status writes survive. Returns how many rows
    /// were inserted.
    ///
    /// Fails with [`StoreError::PlaylistNotFound`] when the playlist is gone.
    async fn add_tracks(&self, playlist_id: &str, tracks: &[Track]) -> Result<usize, StoreError>;

    /// Deletes the playlist and its track records. Returns whether it existed.
    async fn delete_playlist(&self, playlist_id: &str) -> Result<bool, StoreError>;

    async fn delete_track(&self, playlist_id: &str, track_id: &str) -> Result<bool, StoreError>;

    async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, StoreError>;

    async fn update_track_status(
        &self,
        playlist_id: &str,
        track_id: &str,
        status: TrackStatus,
    ) -> Result<(), StoreError>;

    async fn mark_synced(&self, playlist_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn record_attempt(&self, entry: &DownloadLogEntry<'_>) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_attempts(
        &self,
        track_id: &str,
        limit: u32,
    ) -> Result<Vec<DownloadLogRow>, StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct PlaylistRow {
    id: String,
    name: String,
    folder: String,
    source_url: Option<String>,
    syncable: bool,
    last_synced_at: Option<String>,
}

#[derive(Debug, FromRow)]
struct TrackRow {
    track_id: String,
    title: String,
    artist: String,
    duration_secs: Option<i64>,
    candidates: String,
    target_path: String,
    status: String,
}

impl TrackRow {
    fn into_track(self) -> Result<Track, StoreError> {
        let status: TrackStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::invalid_row("status", &self.status))?;
        let candidates: Vec<SourceCandidate> = serde_json::from_str(&self.candidates)
            .map_err(|_| StoreError::invalid_row("candidates", &self.candidates))?;
        let mut track = Track::new(self.track_id, self.title, self.artist, self.target_path)
            .with_candidates(candidates)
            .with_status(status);
        if let Some(secs) = self.duration_secs.and_then(|d| u32::try_from(d).ok()) {
            track = track.with_duration(secs);
        }
        Ok(track)
    }
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|_| StoreError::invalid_row("last_synced_at", raw))
        })
        .transpose()
}

/// `SQLite`-backed [`PlaylistStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    corrupted: Arc<AtomicBool>,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_locks: Arc::new(DashMap::new()),
            corrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// True once any operation hit corruption.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::SeqCst)
    }

    async fn write_guard(&self, playlist_id: &str) -> Result<OwnedMutexGuard<()>, StoreError> {
        self.ensure_writable()?;
        let lock = Arc::clone(
            self.write_locks
                .entry(playlist_id.to_string())
                .or_default()
                .value(),
        );
        Ok(lock.lock_owned().await)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_corrupted() {
            return Err(StoreError::Corruption {
                detail: "writes halted after earlier corruption".to_string(),
            });
        }
        Ok(())
    }

    fn check<T>(&self, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
        result.map_err(|e| {
            let error = StoreError::from(e);
            if error.is_corruption() {
                warn!(error = %error, "store corruption detected; halting writes");
                self.corrupted.store(true, Ordering::SeqCst);
            }
            error
        })
    }

    /// Refuses further writes as if corruption had been detected.
    #[cfg(test)]
    pub(crate) fn halt_writes(&self) {
        self.corrupted.store(true, Ordering::SeqCst);
    }

    async fn tracks_for(&self, playlist_id: &str) -> Result<Vec<Track>, StoreError> {
        let rows = self.check(
            sqlx::query_as::<_, TrackRow>(
                r"SELECT track_id, title, artist, duration_secs, candidates, target_path, status
                  FROM tracks WHERE playlist_id = ? ORDER BY position, track_id",
            )
            .bind(playlist_id)
            .fetch_all(self.db.pool())
            .await,
        )?;
        rows.into_iter().map(TrackRow::into_track).collect()
    }

    async fn hydrate(&self, row: PlaylistRow) -> Result<Playlist, StoreError> {
        let tracks = self.tracks_for(&row.id).await?;
        Ok(Playlist::from_parts(
            row.id,
            row.name,
            PathBuf::from(row.folder),
            row.source_url,
            row.syncable,
            parse_timestamp(row.last_synced_at)?,
            tracks,
        ))
    }

    async fn save_inner(&self, playlist: &Playlist) -> Result<(), sqlx::Error> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO playlists (id, name, folder, source_url, syncable, last_synced_at)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                folder = excluded.folder,
                source_url = excluded.source_url,
                syncable = excluded.syncable,
                last_synced_at = excluded.last_synced_at",
        )
        .bind(playlist.id())
        .bind(playlist.name())
        .bind(playlist.folder().to_string_lossy().into_owned())
        .bind(playlist.source_url())
        .bind(playlist.is_syncable())
        .bind(playlist.last_synced_at().map(|at| at.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT track_id FROM tracks WHERE playlist_id = ?")
                .bind(playlist.id())
                .fetch_all(&mut *tx)
                .await?;
        let wanted = playlist.track_ids();
        for (track_id,) in existing {
            if !wanted.contains(track_id.as_str()) {
                sqlx::query("DELETE FROM tracks WHERE playlist_id = ? AND track_id = ?")
                    .bind(playlist.id())
                    .bind(&track_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let mut seen = HashSet::new();
        for (position, track) in playlist.tracks().iter().enumerate() {
            if !seen.insert(track.id()) {
                continue;
            }
            let candidates =
                serde_json::to_string(track.candidates()).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                r"INSERT INTO tracks
                    (playlist_id, track_id, position, title, artist, duration_secs,
                     candidates, target_path, status, updated_at)
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
                  ON CONFLICT(playlist_id, track_id) DO UPDATE SET
                    position = excluded.position,
                    title = excluded.title,
                    artist = excluded.artist,
                    duration_secs = excluded.duration_secs,
                    candidates = excluded.candidates,
                    target_path = excluded.target_path,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
            )
            .bind(playlist.id())
            .bind(track.id())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(track.title())
            .bind(track.artist())
            .bind(track.duration_secs().map(i64::from))
            .bind(candidates)
            .bind(track.target_path().to_string_lossy().into_owned())
            .bind(track.status().as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// `None` when the playlist row does not exist.
    async fn add_inner(&self, playlist_id: &str, tracks: &[Track]) -> Result<Option<usize>, sqlx::Error> {
        let mut tx = self.db.pool().begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM playlists WHERE id = ?")
            .bind(playlist_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let (next,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM tracks WHERE playlist_id = ?",
        )
        .bind(playlist_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut inserted = 0usize;
        let mut seen = HashSet::new();
        for track in tracks {
            if !seen.insert(track.id()) {
                continue;
            }
            let candidates =
                serde_json::to_string(track.candidates()).unwrap_or_else(|_| "[]".to_string());
            let position = next.saturating_add(i64::try_from(inserted).unwrap_or(i64::MAX));
            let rows = sqlx::query(
                r"INSERT INTO tracks
                    (playlist_id, track_id, position, title, artist, duration_secs,
                     candidates, target_path, status, updated_at)
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
                  ON CONFLICT(playlist_id, track_id) DO NOTHING",
            )
            .bind(playlist_id)
            .bind(track.id())
            .bind(position)
            .bind(track.title())
            .bind(track.artist())
            .bind(track.duration_secs().map(i64::from))
            .bind(candidates)
            .bind(track.target_path().to_string_lossy().into_owned())
            .bind(track.status().as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows > 0 {
                inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(Some(inserted))
    }
}

#[async_trait]
impl PlaylistStore for SqliteStore {
    #[instrument(skip(self))]
    async fn load_playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        let rows = self.check(
            sqlx::query_as::<_, PlaylistRow>(
                r"SELECT id, name, folder, source_url, syncable, last_synced_at
                  FROM playlists ORDER BY created_at, name",
            )
            .fetch_all(self.db.pool())
            .await,
        )?;
        let mut playlists = Vec::with_capacity(rows.len());
        for row in rows {
            playlists.push(self.hydrate(row).await?);
        }
        Ok(playlists)
    }

    async fn load_playlist(&self, playlist_id: &str) -> Result<Option<Playlist>, StoreError> {
        let row = self.check(
            sqlx::query_as::<_, PlaylistRow>(
                r"SELECT id, name, folder, source_url, syncable, last_synced_at
                  FROM playlists WHERE id = ?",
            )
            .bind(playlist_id)
            .fetch_optional(self.db.pool())
            .await,
        )?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_playlist_by_name(&self, name: &str) -> Result<Option<Playlist>, StoreError> {
        let row = self.check(
            sqlx::query_as::<_, PlaylistRow>(
                r"SELECT id, name, folder, source_url, syncable, last_synced_at
                  FROM playlists WHERE name = ? COLLATE NOCASE",
            )
            .bind(name)
            .fetch_optional(self.db.pool())
            .await,
        )?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, playlist), fields(playlist = %playlist.id(), tracks = playlist.len()))]
    async fn save_playlist(&self, playlist: &Playlist) -> Result<(), StoreError> {
        let _guard = self.write_guard(playlist.id()).await?;
        let result = self.save_inner(playlist).await;
        self.check(result)?;
        debug!("playlist saved");
        Ok(())
    }

    #[instrument(skip(self, tracks), fields(tracks = tracks.len()))]
    async fn add_tracks(&self, playlist_id: &str, tracks: &[Track]) -> Result<usize, StoreError> {
        let _guard = self.write_guard(playlist_id).await?;
        let result = self.add_inner(playlist_id, tracks).await;
        let inserted = self
            .check(result)?
            .ok_or_else(|| StoreError::PlaylistNotFound(playlist_id.to_string()))?;
        debug!(inserted, "tracks added");
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn delete_playlist(&self, playlist_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_guard(playlist_id).await?;
        let result = async {
            let mut tx = self.db.pool().begin().await?;
            sqlx::query("DELETE FROM tracks WHERE playlist_id = ?")
                .bind(playlist_id)
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query("DELETE FROM playlists WHERE id = ?")
                .bind(playlist_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(deleted > 0)
        }
        .await;
        let existed = self.check(result)?;
        self.write_locks.remove(playlist_id);
        Ok(existed)
    }

    #[instrument(skip(self))]
    async fn delete_track(&self, playlist_id: &str, track_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_guard(playlist_id).await?;
        let result = self.check(
            sqlx::query("DELETE FROM tracks WHERE playlist_id = ? AND track_id = ?")
                .bind(playlist_id)
                .bind(track_id)
                .execute(self.db.pool())
                .await,
        )?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, StoreError> {
        self.tracks_for(playlist_id).await
    }

    #[instrument(skip(self))]
    async fn update_track_status(
        &self,
        playlist_id: &str,
        track_id: &str,
        status: TrackStatus,
    ) -> Result<(), StoreError> {
        let _guard = self.write_guard(playlist_id).await?;
        let result = self.check(
            sqlx::query(
                r"UPDATE tracks SET status = ?, updated_at = datetime('now')
                  WHERE playlist_id = ? AND track_id = ?",
            )
            .bind(status.as_str())
            .bind(playlist_id)
            .bind(track_id)
            .execute(self.db.pool())
            .await,
        )?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TrackNotFound {
                playlist_id: playlist_id.to_string(),
                track_id: track_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_synced(&self, playlist_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.write_guard(playlist_id).await?;
        let result = self.check(
            sqlx::query("UPDATE playlists SET last_synced_at = ? WHERE id = ?")
                .bind(at.to_rfc3339())
                .bind(playlist_id)
                .execute(self.db.pool())
                .await,
        )?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PlaylistNotFound(playlist_id.to_string()));
        }
        Ok(())
    }

    async fn record_attempt(&self, entry: &DownloadLogEntry<'_>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let attempts = serde_json::to_string(entry.attempts).unwrap_or_else(|_| "[]".to_string());
        self.check(
            sqlx::query(
                r"INSERT INTO download_log
                    (playlist_id, track_id, outcome, failure_kind, backend, file_path, attempts)
                  VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.playlist_id)
            .bind(entry.track_id)
            .bind(entry.outcome.as_str())
            .bind(entry.failure_kind)
            .bind(entry.backend)
            .bind(entry.file_path.map(|p| p.to_string_lossy().into_owned()))
            .bind(attempts)
            .execute(self.db.pool())
            .await,
        )?;
        Ok(())
    }

    async fn recent_attempts(
        &self,
        track_id: &str,
        limit: u32,
    ) -> Result<Vec<DownloadLogRow>, StoreError> {
        self.check(
            sqlx::query_as::<_, DownloadLogRow>(
                r"SELECT id, playlist_id, track_id, outcome, failure_kind, backend, file_path,
                         attempts, created_at
                  FROM download_log WHERE track_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(track_id)
            .bind(i64::from(limit))
            .fetch_all(self.db.pool())
            .await,
        )
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = self.check(
            sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await,
        )?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.check(
            sqlx::query(
                r"INSERT INTO settings (key, value, updated_at) VALUES (?, ?, datetime('now'))
                  ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .execute(self.db.pool())
            .await,
        )?;
        Ok(())
    }
}

/// Deletes a playlist, removing its track files first when the policy says so.
/// Returns how many files were removed.
///
/// # Errors
///
/// [`StoreError::PlaylistNotFound`] for an unknown id, or any store error.
#[instrument(skip(store))]
pub async fn remove_playlist(
    store: &dyn PlaylistStore,
    playlist_id: &str,
    policy: DeletePolicy,
) -> Result<usize, StoreError> {
    let Some(playlist) = store.load_playlist(playlist_id).await? else {
        return Err(StoreError::PlaylistNotFound(playlist_id.to_string()));
    };
    let mut removed = 0;
    if policy == DeletePolicy::DeleteFiles {
        for track in playlist.tracks() {
            match tokio::fs::remove_file(track.target_path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %track.target_path().display(), error = %e, "could not remove track file");
                }
            }
        }
    }
    store.delete_playlist(playlist_id).await?;
    Ok(removed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::download::StepOutcome;

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new_in_memory().await.unwrap())
    }

    fn sample() -> Playlist {
        let mut playlist = Playlist::syncable("p1", "Road Trip", "/music/Road Trip", "https://up/p1");
        let a = playlist
            .new_track("spotify:track:a", "Alpha", "Band")
            .with_duration(200)
            .with_candidates(vec![SourceCandidate::new("https://youtu.be/aaaaaaaaaaa", "Band - Alpha")]);
        let b = playlist.new_track("spotify:track:b", "Beta", "Band");
        playlist.add_track(a);
        playlist.add_track(b);
        playlist
    }

    // ==================== Round Trip Tests ====================

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = store().await;
        let playlist = sample();
        store.save_playlist(&playlist).await.unwrap();

        let loaded = store.load_playlist("p1").await.unwrap().unwrap();
        assert_eq!(loaded, playlist);
        assert_eq!(store.load_playlists().await.unwrap().len(), 1);
        assert!(store.find_playlist_by_name("road trip").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_replaces_track_set_and_keeps_order() {
        let store = store().await;
        let mut playlist = sample();
        store.save_playlist(&playlist).await.unwrap();

        playlist.remove_track("spotify:track:a");
        let c = playlist.new_track("spotify:track:c", "Gamma", "Band");
        playlist.add_track(c);
        store.save_playlist(&playlist).await.unwrap();

        let ids: Vec<String> = store
            .list_tracks("p1")
            .await
            .unwrap()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        assert_eq!(ids, vec!["spotify:track:b", "spotify:track:c"]);
    }

    // ==================== Write Tests ====================

    #[tokio::test]
    async fn test_status_update_and_missing_track() {
        let store = store().await;
        store.save_playlist(&sample()).await.unwrap();
        store
            .update_track_status("p1", "spotify:track:b", TrackStatus::Downloaded)
            .await
            .unwrap();
        let tracks = store.list_tracks("p1").await.unwrap();
        assert_eq!(tracks[1].status(), TrackStatus::Downloaded);

        let err = store
            .update_track_status("p1", "nope", TrackStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TrackNotFound { .. }));
    }

    #[tokio::test]
    async fn test_add_tracks_keeps_stored_rows() {
        let store = store().await;
        let playlist = sample();
        store.save_playlist(&playlist).await.unwrap();
        store
            .update_track_status("p1", "spotify:track:a", TrackStatus::Downloaded)
            .await
            .unwrap();

        let stale_a = playlist.track("spotify:track:a").unwrap().clone();
        let c = playlist.new_track("spotify:track:c", "Gamma", "Band");
        let inserted = store.add_tracks("p1", &[stale_a, c.clone(), c]).await.unwrap();
        assert_eq!(inserted, 1);

        let tracks = store.list_tracks("p1").await.unwrap();
        let ids: Vec<&str> = tracks.iter().map(Track::id).collect();
        assert_eq!(ids, vec!["spotify:track:a", "spotify:track:b", "spotify:track:c"]);
        assert_eq!(tracks[0].status(), TrackStatus::Downloaded);

        let err = store.add_tracks("gone", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::PlaylistNotFound(id) if id == "gone"));
    }

    #[tokio::test]
    async fn test_delete_track_and_playlist() {
        let store = store().await;
        store.save_playlist(&sample()).await.unwrap();
        assert!(store.delete_track("p1", "spotify:track:a").await.unwrap());
        assert!(!store.delete_track("p1", "spotify:track:a").await.unwrap());
        assert!(store.delete_playlist("p1").await.unwrap());
        assert!(store.load_playlist("p1").await.unwrap().is_none());
        assert!(store.list_tracks("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_synced_and_settings() {
        let store = store().await;
        store.save_playlist(&sample()).await.unwrap();
        let at = DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        store.mark_synced("p1", at).await.unwrap();
        assert_eq!(
            store.load_playlist("p1").await.unwrap().unwrap().last_synced_at(),
            Some(at)
        );
        assert!(matches!(
            store.mark_synced("missing", at).await.unwrap_err(),
            StoreError::PlaylistNotFound(_)
        ));

        assert_eq!(store.get_setting("k").await.unwrap(), None);
        store.set_setting("k", "1").await.unwrap();
        store.set_setting("k", "2").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_record_attempt_is_queryable() {
        let store = store().await;
        let steps = vec![AttemptStep::new("spotdown", "direct", StepOutcome::RateLimited)];
        store
            .record_attempt(&DownloadLogEntry {
                playlist_id: Some("p1"),
                track_id: "t1",
                outcome: LogOutcome::Failure,
                failure_kind: Some("all_backends_exhausted"),
                backend: None,
                file_path: None,
                attempts: &steps,
            })
            .await
            .unwrap();
        let rows = store.recent_attempts("t1", 5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, "failure");
        assert!(rows[0].attempts.contains("spotdown"));
    }

    #[tokio::test]
    async fn test_concurrent_status_writes_to_same_playlist() {
        let store = Arc::new(store().await);
        let mut playlist = Playlist::custom("p", "P", "/m");
        for i in 0..20 {
            let track = playlist.new_track(format!("t{i}"), format!("Song {i}"), "A");
            playlist.add_track(track);
        }
        store.save_playlist(&playlist).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update_track_status("p", &format!("t{i}"), TrackStatus::Downloaded)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let tracks = store.list_tracks("p").await.unwrap();
        assert!(tracks.iter().all(|t| t.status() == TrackStatus::Downloaded));
    }

    #[tokio::test]
    async fn test_remove_playlist_with_file_policy() {
        let dir = TempDir::new().unwrap();
        let store = store().await;
        let mut playlist = Playlist::custom("p", "P", dir.path());
        let track = playlist.new_track("t", "Song", "A");
        std::fs::write(track.target_path(), b"ID3").unwrap();
        let path = track.target_path().to_path_buf();
        playlist.add_track(track);
        store.save_playlist(&playlist).await.unwrap();

        let removed = remove_playlist(&store, "p", DeletePolicy::DeleteFiles).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!path.exists());
        assert!(matches!(
            remove_playlist(&store, "p", DeletePolicy::KeepFiles).await.unwrap_err(),
            StoreError::PlaylistNotFound(_)
        ));
    }
}
