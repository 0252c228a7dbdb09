//! Playlist audit and repair against a real store and scripted backend.

mod support;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tracksync_core::integrity::audit::{audit, repair};
use tracksync_core::integrity::{IntegrityChecker, VerificationResult};
use tracksync_core::playlist::{Playlist, Track, TrackStatus};
use tracksync_core::store::{PlaylistStore, reconcile_with_filesystem};

use support::{ScriptedBackend, Step, audio_bytes, fast_config, memory_store, orchestrator, test_policy};

#[tokio::test]
async fn test_audit_then_repair_restores_playlist() {
    let dir = TempDir::new().unwrap();
    let store = memory_store().await;
    let mut playlist = Playlist::custom("p", "Mix", dir.path());
    for (id, title) in [("t:good", "Good"), ("t:empty", "Empty"), ("t:gone", "Gone")] {
        playlist.add_track(
            Track::in_folder(id, title, "Artist", dir.path()).with_status(TrackStatus::Downloaded),
        );
    }
    std::fs::write(playlist.track("t:good").unwrap().target_path(), audio_bytes(4096)).unwrap();
    std::fs::write(playlist.track("t:empty").unwrap().target_path(), b"").unwrap();
    store.save_playlist(&playlist).await.unwrap();

    let backend = ScriptedBackend::new("a", Step::Write(4096));
    let orchestrator = orchestrator(
        &[backend.clone()],
        store.clone(),
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );

    let report = audit(store.as_ref(), orchestrator.integrity(), "p").await.unwrap();
    assert_eq!(report.valid, 1);
    assert_eq!(report.corrupted.len(), 1);
    assert_eq!(report.corrupted[0].1, VerificationResult::Empty);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.total(), 3);

    let statuses = store.list_tracks("p").await.unwrap();
    let status_of = |id: &str| statuses.iter().find(|t| t.id() == id).unwrap().status();
    assert_eq!(status_of("t:empty"), TrackStatus::Corrupt);
    assert_eq!(status_of("t:gone"), TrackStatus::Missing);

    let summary = repair(&orchestrator, &report, &CancellationToken::new()).await;
    assert_eq!(summary.removed_files, 1);
    assert_eq!(summary.redownloaded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(backend.calls(), 2);

    let after = audit(store.as_ref(), orchestrator.integrity(), "p").await.unwrap();
    assert!(after.is_clean());
    let tracks = store.list_tracks("p").await.unwrap();
    assert!(tracks.iter().all(|t| t.status() == TrackStatus::Downloaded));
}

#[tokio::test]
async fn test_reconcile_after_files_vanish() {
    let dir = TempDir::new().unwrap();
    let store = memory_store().await;
    let mut playlist = Playlist::custom("p", "Mix", dir.path());
    playlist.add_track(Track::in_folder("t:1", "One", "Artist", dir.path()).with_status(TrackStatus::Downloaded));
    playlist.add_track(Track::in_folder("t:2", "Two", "Artist", dir.path()));
    std::fs::write(playlist.track("t:2").unwrap().target_path(), audio_bytes(256)).unwrap();
    store.save_playlist(&playlist).await.unwrap();

    let summary = reconcile_with_filesystem(store.as_ref(), "p").await.unwrap();

    assert_eq!(summary.marked_missing, 1);
    assert_eq!(summary.marked_downloaded, 1);
    let tracks = store.list_tracks("p").await.unwrap();
    assert_eq!(tracks[0].status(), TrackStatus::Missing);
    assert_eq!(tracks[1].status(), TrackStatus::Downloaded);
}
