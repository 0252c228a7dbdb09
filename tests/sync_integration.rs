//! Integration tests for playlist sync and the request/response service.

mod support;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tracksync_core::download::{AttemptOptions, FailureKind, Orchestrator};
use tracksync_core::integrity::IntegrityChecker;
use tracksync_core::notify::{ChannelNotifier, Notification};
use tracksync_core::playlist::{Playlist, RemovedTrackPolicy, Track, TrackStatus};
use tracksync_core::service::{CoreService, DownloadRequest, SyncRequest};
use tracksync_core::store::{PlaylistStore, SqliteStore};
use tracksync_core::sync::{PlaylistSource, SourceError, SyncConfig, SyncEngine, SyncError, SyncState};

use support::{
    CannedSource, ScriptedBackend, audio_bytes, fast_config, memory_store, orchestrator,
    test_policy, upstream_tracks,
};

struct Fixture {
    dir: TempDir,
    store: Arc<SqliteStore>,
    source: Arc<CannedSource>,
    engine: Arc<SyncEngine>,
    orchestrator: Arc<Orchestrator>,
    backend: Arc<ScriptedBackend>,
}

async fn fixture(rejects: &[&str]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = memory_store().await;
    let source = CannedSource::new();
    let backend = ScriptedBackend::rejecting("a", rejects);
    let orchestrator = Arc::new(orchestrator(
        &[backend.clone()],
        store.clone(),
        IntegrityChecker::new(test_policy()),
        fast_config(),
    ));
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        source.clone(),
        Arc::clone(&orchestrator),
        SyncConfig::default(),
    ));
    Fixture {
        dir,
        store,
        source,
        engine,
        orchestrator,
        backend,
    }
}

/// Stores a syncable playlist holding `tracks`, each with a good file on disk.
async fn seed_downloaded(fx: &Fixture, id: &str, tracks: &[(String, String, String)]) -> Playlist {
    let folder = fx.dir.path().join(id);
    std::fs::create_dir_all(&folder).unwrap();
    let mut playlist = Playlist::syncable(id, id, &folder, format!("https://open.spotify.com/playlist/{id}"));
    for (track_id, title, artist) in tracks {
        let track = Track::in_folder(track_id.clone(), title.clone(), artist.clone(), &folder)
            .with_status(TrackStatus::Downloaded);
        std::fs::write(track.target_path(), audio_bytes(4096)).unwrap();
        playlist.add_track(track);
    }
    fx.store.save_playlist(&playlist).await.unwrap();
    playlist
}

fn engine_with(fx: &Fixture, source: Arc<dyn PlaylistSource>, config: SyncConfig) -> SyncEngine {
    SyncEngine::new(fx.store.clone(), source, Arc::clone(&fx.orchestrator), config)
}

/// Another writer touching the store while upstream is being fetched.
#[derive(Clone, Copy)]
enum Interference {
    MarkDownloaded(&'static str),
    DeletePlaylist,
}

struct InterferingSource {
    store: Arc<SqliteStore>,
    upstream: Arc<CannedSource>,
    interference: Interference,
}

#[async_trait]
impl PlaylistSource for InterferingSource {
    async fn fetch_tracks(&self, playlist: &Playlist) -> Result<Vec<Track>, SourceError> {
        match self.interference {
            Interference::MarkDownloaded(track_id) => self
                .store
                .update_track_status(playlist.id(), track_id, TrackStatus::Downloaded)
                .await
                .unwrap(),
            Interference::DeletePlaylist => {
                assert!(self.store.delete_playlist(playlist.id()).await.unwrap());
            }
        }
        self.upstream.fetch_tracks(playlist).await
    }
}

/// Holds every fetch until released.
struct GatedSource {
    upstream: Arc<CannedSource>,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PlaylistSource for GatedSource {
    async fn fetch_tracks(&self, playlist: &Playlist) -> Result<Vec<Track>, SourceError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.upstream.fetch_tracks(playlist).await
    }
}

// ==================== Sync Pass Tests ====================

#[tokio::test]
async fn test_sync_downloads_new_tracks_and_reports_failures() {
    let fx = fixture(&["track:9"]).await;
    let upstream = upstream_tracks(0..10);
    seed_downloaded(&fx, "mix", &upstream[..7]).await;
    fx.store
        .save_playlist(&Playlist::custom("mine", "Mine", fx.dir.path().join("mine")))
        .await
        .unwrap();
    fx.source.set("mix", upstream.clone());

    let report = fx
        .engine
        .sync_playlist("mix", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.added, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.unchanged, 7);
    assert_eq!(report.redownloaded, 0);
    assert_eq!(report.total_syncable, 1);
    assert_eq!(report.total_custom_excluded, 1);
    assert_eq!(report.failures[0].track_id, "track:9");
    assert_eq!(report.failures[0].kind, FailureKind::AllBackendsExhausted);
    assert_eq!(fx.backend.calls(), 3);

    let stored = fx.store.load_playlist("mix").await.unwrap().unwrap();
    let stored_ids: HashSet<&str> = stored.tracks().iter().map(Track::id).collect();
    let upstream_ids: HashSet<&str> = upstream.iter().map(|(id, _, _)| id.as_str()).collect();
    assert_eq!(stored_ids, upstream_ids);
    assert_eq!(stored.track("track:9").unwrap().status(), TrackStatus::Failed);
    assert_eq!(stored.track("track:8").unwrap().status(), TrackStatus::Downloaded);
    assert!(stored.last_synced_at().is_some());
}

#[tokio::test]
async fn test_sync_redownloads_lost_files() {
    let fx = fixture(&[]).await;
    let upstream = upstream_tracks(0..3);
    let playlist = seed_downloaded(&fx, "mix", &upstream).await;
    std::fs::remove_file(playlist.track("track:1").unwrap().target_path()).unwrap();
    fx.source.set("mix", upstream);

    let report = fx
        .engine
        .sync_playlist("mix", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.added, 0);
    assert_eq!(report.redownloaded, 1);
    assert_eq!(fx.backend.calls(), 1);
    assert!(playlist.track("track:1").unwrap().target_path().exists());
}

#[tokio::test]
async fn test_custom_playlist_is_never_fetched() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "one", &[]).await;
    seed_downloaded(&fx, "two", &[]).await;
    fx.store
        .save_playlist(&Playlist::custom("mine", "Mine", fx.dir.path().join("mine")))
        .await
        .unwrap();
    fx.source.set("one", upstream_tracks(0..2));
    fx.source.set("two", upstream_tracks(2..3));

    let outcome = fx.engine.sync_all(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.summary.synced, 2);
    assert_eq!(outcome.summary.new_tracks, 3);
    assert_eq!(outcome.summary.errors, 0);
    assert_eq!(outcome.total_custom_excluded, 1);
    assert!(!fx.source.fetched().contains(&"mine".to_string()));

    let err = fx
        .engine
        .sync_playlist("mine", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotSyncable(_)));
    assert!(!fx.source.fetched().contains(&"mine".to_string()));
}

#[tokio::test]
async fn test_sync_all_collects_per_playlist_errors() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "ok", &[]).await;
    seed_downloaded(&fx, "gone", &[]).await;
    fx.source.set("ok", upstream_tracks(0..1));

    let outcome = fx.engine.sync_all(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.summary.synced, 1);
    assert_eq!(outcome.summary.errors, 1);
    assert_eq!(outcome.errors[0].0, "gone");
}

#[tokio::test]
async fn test_sync_without_auto_download_stores_pending_tracks() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &[]).await;
    fx.source.set("mix", upstream_tracks(0..2));
    let engine = SyncEngine::new(
        fx.store.clone(),
        fx.source.clone(),
        Arc::clone(&fx.orchestrator),
        SyncConfig {
            auto_download: false,
            ..SyncConfig::default()
        },
    );

    let report = engine.sync_playlist("mix", &CancellationToken::new()).await.unwrap();

    assert_eq!(report.pending, 2);
    assert_eq!(fx.backend.calls(), 0);
    let tracks = fx.store.list_tracks("mix").await.unwrap();
    assert!(tracks.iter().all(|t| t.status() == TrackStatus::Pending));
}

#[tokio::test]
async fn test_sync_finished_is_announced() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &[]).await;
    fx.source.set("mix", upstream_tracks(0..1));
    let (notifier, mut rx) = ChannelNotifier::new();
    let engine = SyncEngine::new(
        fx.store.clone(),
        fx.source.clone(),
        Arc::clone(&fx.orchestrator),
        SyncConfig::default(),
    )
    .with_notifier(Arc::new(notifier));

    engine.sync_playlist("mix", &CancellationToken::new()).await.unwrap();

    match rx.recv().await.unwrap() {
        Notification::SyncFinished(report) => assert_eq!(report.added, 1),
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[tokio::test]
async fn test_second_pass_on_same_playlist_is_refused() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &[]).await;
    fx.source.set("mix", upstream_tracks(0..1));
    let gated = Arc::new(GatedSource {
        upstream: fx.source.clone(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = engine_with(&fx, gated.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(engine.sync_playlist("mix", &cancel), async {
        gated.entered.notified().await;
        assert_eq!(engine.state("mix"), SyncState::Fetching);
        let refused = engine.sync_playlist("mix", &cancel).await;
        gated.release.notify_one();
        refused
    });

    assert!(matches!(second, Err(SyncError::AlreadyRunning(_))));
    assert_eq!(first.unwrap().added, 1);
    assert_eq!(engine.state("mix"), SyncState::Idle);
    assert_eq!(fx.backend.calls(), 1);
}

#[tokio::test]
async fn test_fetch_failure_leaves_playlist_untouched() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &upstream_tracks(0..3)).await;
    let before = fx.store.load_playlist("mix").await.unwrap().unwrap();
    let (notifier, mut rx) = ChannelNotifier::new();
    let engine = engine_with(&fx, fx.source.clone(), SyncConfig::default()).with_notifier(Arc::new(notifier));

    let err = engine
        .sync_playlist("mix", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Fetch { .. }));
    let after = fx.store.load_playlist("mix").await.unwrap().unwrap();
    assert_eq!(after.tracks(), before.tracks());
    assert_eq!(after.last_synced_at(), None);
    assert_eq!(engine.state("mix"), SyncState::Idle);
    assert_eq!(fx.backend.calls(), 0);
    match rx.try_recv().unwrap() {
        Notification::SyncFailed { playlist_id, error, .. } => {
            assert_eq!(playlist_id, "mix");
            assert!(error.contains("mix"));
        }
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[tokio::test]
async fn test_status_written_during_fetch_survives_sync() {
    let fx = fixture(&[]).await;
    let upstream = upstream_tracks(0..3);
    seed_downloaded(&fx, "mix", &upstream[1..2]).await;
    let folder = fx.dir.path().join("mix");
    let (id, title, artist) = &upstream[0];
    let pending = Track::in_folder(id.clone(), title.clone(), artist.clone(), &folder);
    std::fs::write(pending.target_path(), audio_bytes(4096)).unwrap();
    assert_eq!(fx.store.add_tracks("mix", &[pending]).await.unwrap(), 1);
    fx.source.set("mix", upstream);
    let source = Arc::new(InterferingSource {
        store: fx.store.clone(),
        upstream: fx.source.clone(),
        interference: Interference::MarkDownloaded("track:0"),
    });
    let engine = engine_with(&fx, source, SyncConfig::default());

    let report = engine.sync_playlist("mix", &CancellationToken::new()).await.unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(fx.backend.calls(), 1, "only the new track is fetched");
    let stored = fx.store.load_playlist("mix").await.unwrap().unwrap();
    assert_eq!(stored.track("track:0").unwrap().status(), TrackStatus::Downloaded);
    assert_eq!(stored.track("track:2").unwrap().status(), TrackStatus::Downloaded);
}

#[tokio::test]
async fn test_playlist_deleted_during_fetch_stays_deleted() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &upstream_tracks(0..1)).await;
    fx.source.set("mix", upstream_tracks(0..3));
    let source = Arc::new(InterferingSource {
        store: fx.store.clone(),
        upstream: fx.source.clone(),
        interference: Interference::DeletePlaylist,
    });
    let engine = engine_with(&fx, source, SyncConfig::default());

    let err = engine
        .sync_playlist("mix", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::PlaylistNotFound(ref id) if id == "mix"));
    assert!(fx.store.load_playlist("mix").await.unwrap().is_none());
    assert!(fx.store.list_tracks("mix").await.unwrap().is_empty());
    assert_eq!(fx.backend.calls(), 0);
    assert_eq!(engine.state("mix"), SyncState::Idle);
}

#[tokio::test]
async fn test_forget_policy_drops_removed_tracks() {
    let fx = fixture(&[]).await;
    seed_downloaded(&fx, "mix", &upstream_tracks(0..3)).await;
    fx.source.set("mix", upstream_tracks(1..3));
    let engine = engine_with(
        &fx,
        fx.source.clone(),
        SyncConfig {
            removed_tracks: RemovedTrackPolicy::Forget,
            ..SyncConfig::default()
        },
    );

    let report = engine.sync_playlist("mix", &CancellationToken::new()).await.unwrap();

    assert_eq!(report.removed, 1);
    let ids: Vec<String> = fx
        .store
        .list_tracks("mix")
        .await
        .unwrap()
        .iter()
        .map(|t| t.id().to_string())
        .collect();
    assert_eq!(ids, vec!["track:1", "track:2"]);
}

// ==================== Service Tests ====================

#[tokio::test]
async fn test_service_answers_download_and_sync_requests() {
    let fx = fixture(&[]).await;
    let playlist = seed_downloaded(&fx, "mix", &[]).await;
    fx.source.set("mix", upstream_tracks(0..2));
    let cancel = CancellationToken::new();
    let (service, handle) = CoreService::new(
        Arc::clone(&fx.orchestrator),
        Arc::clone(&fx.engine),
        8,
        cancel.clone(),
    );
    let task = service.spawn();

    let track = Track::in_folder("spotify:track:solo", "Solo", "Artist", playlist.folder());
    let download = handle.download(DownloadRequest {
        track: track.clone(),
        options: AttemptOptions::default(),
    });
    let sync = handle.sync(SyncRequest {
        playlist_id: "mix".to_string(),
    });
    let (outcome, report) = tokio::join!(download, sync);

    assert!(outcome.unwrap().is_success());
    assert_eq!(report.unwrap().unwrap().added, 2);
    assert!(track.target_path().exists());

    let missing = handle
        .sync(SyncRequest {
            playlist_id: "nope".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(missing, Err(SyncError::PlaylistNotFound(_))));

    cancel.cancel();
    task.await.unwrap();
    assert!(handle.sync_all().await.is_err());
}
