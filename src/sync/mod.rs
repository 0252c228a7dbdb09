//! Playlist synchronization against upstream sources.
//!
//! - [`SyncEngine`] - per-playlist state machine driving the orchestrator
//! - [`PlaylistSource`] - where upstream track lists come from
//! - [`SyncSchedule`] / [`run_scheduler`] - weekly scheduled passes
//!
//! Custom (non-syncable) playlists never reach the fetching state; a
//! playlist is never in two passes at once, different playlists may be.

mod report;
mod schedule;
mod source;
mod state;

pub use report::{PassOutcome, PassSummary, SyncReport, TrackFailureSummary};
pub use schedule::{
    KEY_DAY, KEY_ENABLED, KEY_LAST_SYNC, KEY_NOTIFY, KEY_TIME, ScheduleError, SyncSchedule,
    last_sync, parse_time, parse_weekday, run_scheduler,
};
pub use source::{PlaylistSource, SongDetailsSource, SourceError};
pub use state::SyncState;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::{AttemptOptions, Orchestrator, Outcome};
use crate::notify::{Notification, Notifier};
use crate::playlist::{Playlist, RemovedTrackPolicy, SyncDelta, Track};
use crate::store::{PlaylistStore, StoreError};

/// Playlists synced at once during a full pass.
pub const DEFAULT_SYNC_PARALLELISM: usize = 2;

/// Tracks of one playlist handed to the orchestrator at once.
pub const DEFAULT_TRACK_PARALLELISM: usize = 4;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),

    #[error("playlist {0} is a custom playlist and is not synced")]
    NotSyncable(String),

    #[error("playlist {0} is already syncing")]
    AlreadyRunning(String),

    #[error("could not fetch upstream tracks for {playlist}: {source}")]
    Fetch {
        playlist: String,
        #[source]
        source: SourceError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Playlists synced at once during a full pass.
    pub parallelism: usize,
    /// Tracks of one playlist downloaded at once.
    pub track_parallelism: usize,
    pub removed_tracks: RemovedTrackPolicy,
    /// Download new tracks during sync; otherwise they are stored as pending.
    pub auto_download: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_SYNC_PARALLELISM,
            track_parallelism: DEFAULT_TRACK_PARALLELISM,
            removed_tracks: RemovedTrackPolicy::Keep,
            auto_download: true,
        }
    }
}

/// Resets a playlist's state to `Idle` however the pass ends.
struct StateGuard<'a> {
    states: &'a DashMap<String, SyncState>,
    playlist_id: &'a str,
}

impl StateGuard<'_> {
    fn advance(&self, next: SyncState) {
        if let Some(mut state) = self.states.get_mut(self.playlist_id) {
            debug_assert!(state.can_advance_to(next), "{} -> {next}", *state);
            debug!(playlist = self.playlist_id, from = %*state, to = %next, "sync state");
            *state = next;
        }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.states.insert(self.playlist_id.to_string(), SyncState::Idle);
    }
}

/// Reconciles stored playlists with their upstream sources.
pub struct SyncEngine {
    store: Arc<dyn PlaylistStore>,
    source: Arc<dyn PlaylistSource>,
    orchestrator: Arc<Orchestrator>,
    notifier: Option<Arc<dyn Notifier>>,
    config: SyncConfig,
    states: DashMap<String, SyncState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn PlaylistStore>,
        source: Arc<dyn PlaylistSource>,
        orchestrator: Arc<Orchestrator>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            source,
            orchestrator,
            notifier: None,
            config,
            states: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PlaylistStore> {
        &self.store
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Current state of a playlist's sync pass.
    #[must_use]
    pub fn state(&self, playlist_id: &str) -> SyncState {
        self.states
            .get(playlist_id)
            .map_or(SyncState::Idle, |s| *s)
    }

    /// Syncs one playlist on demand.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotSyncable`] for custom playlists,
    /// [`SyncError::AlreadyRunning`] if a pass is in progress, fetch and
    /// store failures otherwise. Individual track failures are reported in
    /// the [`SyncReport`], not as errors.
    #[instrument(skip(self, cancel))]
    pub async fn sync_playlist(
        &self,
        playlist_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let playlists = self.store.load_playlists().await?;
        let (total_syncable, total_custom) = count_kinds(&playlists);
        let playlist = playlists
            .into_iter()
            .find(|p| p.id() == playlist_id)
            .ok_or_else(|| SyncError::PlaylistNotFound(playlist_id.to_string()))?;
        let mut report = self.run_pass(playlist, cancel).await?;
        report.total_syncable = total_syncable;
        report.total_custom_excluded = total_custom;
        self.announce(&report);
        Ok(report)
    }

    /// Syncs every syncable playlist with bounded parallelism and records
    /// the pass time. Custom playlists are counted but never fetched.
    ///
    /// # Errors
    ///
    /// Only when the playlist list itself cannot be read; per-playlist
    /// failures land in [`PassOutcome::errors`].
    #[instrument(skip_all)]
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<PassOutcome, SyncError> {
        let playlists = self.store.load_playlists().await?;
        let (total_syncable, total_custom) = count_kinds(&playlists);
        let syncable: Vec<Playlist> = playlists.into_iter().filter(Playlist::is_syncable).collect();
        info!(
            syncable = total_syncable,
            custom_excluded = total_custom,
            "starting sync of all playlists"
        );

        let results: Vec<(String, Result<SyncReport, SyncError>)> = stream::iter(syncable)
            .map(|playlist| {
                async move {
                    let name = playlist.name().to_string();
                    (name, self.run_pass(playlist, cancel).await)
                }
                .boxed()
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut outcome = PassOutcome {
            total_custom_excluded: total_custom,
            ..PassOutcome::default()
        };
        outcome.summary.total = total_syncable;
        for (name, result) in results {
            match result {
                Ok(mut report) => {
                    report.total_syncable = total_syncable;
                    report.total_custom_excluded = total_custom;
                    outcome.summary.synced += 1;
                    outcome.summary.new_tracks += report.added;
                    self.announce(&report);
                    outcome.reports.push(report);
                }
                Err(error) => {
                    warn!(playlist = %name, error = %error, "playlist sync failed");
                    outcome.summary.errors += 1;
                    outcome.errors.push((name, error.to_string()));
                }
            }
        }

        if let Err(error) = self
            .store
            .set_setting(KEY_LAST_SYNC, &Utc::now().to_rfc3339())
            .await
        {
            warn!(error = %error, "could not record last sync time");
        }
        info!(
            synced = outcome.summary.synced,
            total = outcome.summary.total,
            new_tracks = outcome.summary.new_tracks,
            errors = outcome.summary.errors,
            "sync of all playlists finished"
        );
        Ok(outcome)
    }

    /// One pass over `playlist`. The stored copy is re-read under the pass
    /// lock and again after the upstream fetch, and only the delta is
    /// written, so status writes made while the pass runs are kept.
    async fn run_pass(
        &self,
        playlist: Playlist,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        if !playlist.is_syncable() {
            return Err(SyncError::NotSyncable(playlist.name().to_string()));
        }
        let playlist_id = playlist.id().to_string();
        let lock = Arc::clone(self.locks.entry(playlist_id.clone()).or_default().value());
        let Ok(_pass) = lock.try_lock_owned() else {
            return Err(SyncError::AlreadyRunning(playlist.name().to_string()));
        };

        self.states.insert(playlist_id.clone(), SyncState::Idle);
        let guard = StateGuard {
            states: &self.states,
            playlist_id: &playlist_id,
        };

        let playlist = self.reload(&playlist_id).await?;
        guard.advance(SyncState::Fetching);
        let upstream = match self.source.fetch_tracks(&playlist).await {
            Ok(upstream) => upstream,
            Err(source) => {
                let error = SyncError::Fetch {
                    playlist: playlist.name().to_string(),
                    source,
                };
                self.announce_failure(&playlist, &error);
                return Err(error);
            }
        };

        guard.advance(SyncState::Diffing);
        let stored = self.reload(&playlist_id).await?;
        let delta = SyncDelta::compute(&stored, &upstream);
        let upstream_ids: HashSet<&str> = upstream.iter().map(Track::id).collect();
        let mut requeue = Vec::new();
        for track in stored.tracks() {
            if upstream_ids.contains(track.id())
                && !tokio::fs::try_exists(track.target_path()).await.unwrap_or(false)
            {
                debug!(track_id = %track.id(), "file missing; will re-download");
                requeue.push(track.clone());
            }
        }
        info!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            unchanged = delta.unchanged,
            requeued = requeue.len(),
            "computed sync delta"
        );
        self.persist_delta(&stored, &delta).await?;

        let mut report = SyncReport {
            playlist_id: playlist_id.clone(),
            playlist_name: stored.name().to_string(),
            removed: delta.removed.len(),
            unchanged: delta.unchanged,
            ..SyncReport::default()
        };

        guard.advance(SyncState::Downloading);
        if self.config.auto_download {
            self.download(&stored, &delta.added, &requeue, &mut report, cancel)
                .await;
        } else {
            report.pending = delta.added.len();
        }

        guard.advance(SyncState::Reporting);
        if !report.cancelled {
            self.store.mark_synced(&playlist_id, Utc::now()).await?;
        }
        info!(
            added = report.added,
            failed = report.failed,
            redownloaded = report.redownloaded,
            "playlist sync finished"
        );
        Ok(report)
    }

    async fn reload(&self, playlist_id: &str) -> Result<Playlist, SyncError> {
        self.store
            .load_playlist(playlist_id)
            .await?
            .ok_or_else(|| SyncError::PlaylistNotFound(playlist_id.to_string()))
    }

    /// Inserts new tracks and, under [`RemovedTrackPolicy::Forget`], drops
    /// removed ones. Existing rows are never rewritten.
    async fn persist_delta(&self, stored: &Playlist, delta: &SyncDelta) -> Result<(), SyncError> {
        if !delta.added.is_empty() {
            match self.store.add_tracks(stored.id(), &delta.added).await {
                Ok(_) => {}
                Err(StoreError::PlaylistNotFound(id)) => return Err(SyncError::PlaylistNotFound(id)),
                Err(error) => return Err(error.into()),
            }
        }
        if self.config.removed_tracks == RemovedTrackPolicy::Forget {
            for track_id in &delta.removed {
                self.store.delete_track(stored.id(), track_id).await?;
            }
        }
        Ok(())
    }

    async fn download(
        &self,
        playlist: &Playlist,
        added: &[Track],
        requeue: &[Track],
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) {
        let options = AttemptOptions::for_playlist(playlist.id());
        let work: Vec<(&Track, bool)> = added
            .iter()
            .map(|t| (t, true))
            .chain(requeue.iter().map(|t| (t, false)))
            .collect();

        let futures: Vec<_> = work
            .into_iter()
            .map(|(track, is_new)| {
                let options = &options;
                async move {
                    let outcome = self.orchestrator.attempt(track, options, cancel).await;
                    (track, is_new, outcome)
                }
                .boxed()
            })
            .collect();
        let results: Vec<(&Track, bool, Outcome)> = stream::iter(futures)
            .buffer_unordered(self.config.track_parallelism.max(1))
            .collect()
            .await;

        for (track, is_new, outcome) in results {
            match outcome {
                Outcome::Success { .. } if is_new => report.added += 1,
                Outcome::Success { .. } => report.redownloaded += 1,
                Outcome::Failure { kind, .. } => {
                    report.failed += 1;
                    report.failures.push(TrackFailureSummary {
                        track_id: track.id().to_string(),
                        title: track.title().to_string(),
                        artist: track.artist().to_string(),
                        kind,
                    });
                }
                Outcome::Cancelled => report.cancelled = true,
            }
        }
    }

    fn announce(&self, report: &SyncReport) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(Notification::SyncFinished(report.clone()));
        }
    }

    fn announce_failure(&self, playlist: &Playlist, error: &SyncError) {
        warn!(playlist = %playlist.name(), error = %error, "upstream fetch failed");
        if let Some(notifier) = &self.notifier {
            notifier.notify(Notification::SyncFailed {
                playlist_id: playlist.id().to_string(),
                playlist_name: playlist.name().to_string(),
                error: error.to_string(),
            });
        }
    }
}

fn count_kinds(playlists: &[Playlist]) -> (usize, usize) {
    let syncable = playlists.iter().filter(|p| p.is_syncable()).count();
    (syncable, playlists.len() - syncable)
}
