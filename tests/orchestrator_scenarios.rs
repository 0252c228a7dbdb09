//! End-to-end scenarios for the download orchestrator: fallback, exhaustion,
//! integrity auto-fix, deduplication and idempotence.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tracksync_core::download::{AttemptOptions, FailureKind, FailureType, Outcome, StepOutcome, staging_path};
use tracksync_core::integrity::{FixedProbe, IntegrityChecker, IntegrityPolicy};
use tracksync_core::playlist::{Playlist, Track, TrackStatus};
use tracksync_core::store::PlaylistStore;

use support::{ScriptedBackend, Step, fast_config, memory_store, orchestrator, test_policy};

fn t1(dir: &TempDir) -> Track {
    Track::in_folder("spotify:track:abc", "Song", "Artist", dir.path()).with_duration(210)
}

// ==================== Fallback Tests ====================

#[tokio::test]
async fn test_rate_limited_backend_falls_through_to_next_and_verifies() {
    let dir = TempDir::new().unwrap();
    let store = memory_store().await;
    let mut playlist = Playlist::custom("p1", "Mix", dir.path());
    playlist.add_track(t1(&dir));
    store.save_playlist(&playlist).await.unwrap();

    let a = ScriptedBackend::new("a", Step::Fail(FailureType::RateLimited));
    let b = ScriptedBackend::new("b", Step::Write(8192));
    let checker = IntegrityChecker::new(test_policy()).with_probe(Arc::new(FixedProbe(Some(207.0))));
    let orchestrator = orchestrator(&[a.clone(), b.clone()], store.clone(), checker, fast_config());

    let outcome = orchestrator
        .attempt(&t1(&dir), &AttemptOptions::for_playlist("p1"), &CancellationToken::new())
        .await;

    let Outcome::Success { path, backend, record } = &outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(backend.as_deref(), Some("b"));
    assert!(path.exists());
    assert!(!staging_path(path).exists());
    assert_eq!(a.calls(), 2, "rate-limited backend retried once before moving on");
    assert_eq!(b.calls(), 1);
    assert!(record.steps().iter().any(|s| s.backend == "a" && s.outcome == StepOutcome::RateLimited));
    assert_eq!(record.steps().last().unwrap().outcome, StepOutcome::Success);

    let tracks = store.list_tracks("p1").await.unwrap();
    assert_eq!(tracks[0].status(), TrackStatus::Downloaded);
}

#[tokio::test]
async fn test_every_backend_rejecting_exhausts_with_one_step_each() {
    let dir = TempDir::new().unwrap();
    let backends: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| ScriptedBackend::new(name, Step::Fail(FailureType::Permanent)))
        .collect();
    let orchestrator = orchestrator(
        &backends,
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );

    let track = Track::in_folder("spotify:track:t2", "T2", "Artist", dir.path());
    let outcome = orchestrator
        .attempt(&track, &AttemptOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::AllBackendsExhausted));
    let record = outcome.record().unwrap();
    assert_eq!(record.len(), 3);
    assert_eq!(record.backends_tried(), vec!["a", "b", "c"]);
    for backend in &backends {
        assert_eq!(backend.calls(), 1, "permanent rejection is never retried");
    }
    assert!(!track.target_path().exists());
}

// ==================== Integrity Tests ====================

#[tokio::test]
async fn test_empty_file_is_fixed_once_then_reported() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new("a", Step::Empty);
    let orchestrator = orchestrator(
        &[backend.clone()],
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );
    let track = Track::in_folder("spotify:track:empty", "Hollow", "Artist", dir.path());

    let outcome = orchestrator
        .attempt(&track, &AttemptOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::IntegrityDefect));
    assert_eq!(backend.calls(), 2, "one download plus exactly one auto-fix");
    let defects = outcome
        .record()
        .unwrap()
        .steps()
        .iter()
        .filter(|s| s.outcome == StepOutcome::IntegrityDefect)
        .count();
    assert_eq!(defects, 2);
    assert!(!track.target_path().exists());
    assert!(!staging_path(track.target_path()).exists());
}

#[tokio::test]
async fn test_auto_fix_recovers_when_second_download_is_good() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::scripted("a", vec![Step::Empty], Step::Write(4096));
    let orchestrator = orchestrator(
        &[backend.clone()],
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );
    let track = Track::in_folder("spotify:track:fix", "Fixed", "Artist", dir.path());

    let outcome = orchestrator
        .attempt(&track, &AttemptOptions::default(), &CancellationToken::new())
        .await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(backend.calls(), 2);
}

/// `(tolerance_secs, tolerance_pct, probed, passes)` for a 210 s track.
const TOLERANCE_CASES: [(f64, f64, f64, bool); 5] = [
    (5.0, 0.03, 207.0, true),
    (5.0, 0.0, 204.0, false),
    (2.0, 0.0, 207.0, false),
    (0.0, 0.03, 204.0, true),
    (0.0, 0.01, 207.0, false),
];

#[tokio::test]
async fn test_duration_tolerance_is_configurable() {
    for (secs, pct, probed, passes) in TOLERANCE_CASES {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new("a", Step::Write(4096));
        let policy = IntegrityPolicy {
            tolerance_secs: secs,
            tolerance_pct: pct,
            ..test_policy()
        };
        let checker = IntegrityChecker::new(policy).with_probe(Arc::new(FixedProbe(Some(probed))));
        let orchestrator = orchestrator(&[backend], memory_store().await, checker, fast_config());

        let outcome = orchestrator
            .attempt(&t1(&dir), &AttemptOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.is_success(),
            passes,
            "tolerance {secs}s/{pct} with probe {probed}: {outcome:?}"
        );
        if !passes {
            assert_eq!(outcome.failure_kind(), Some(FailureKind::IntegrityDefect));
        }
    }
}

// ==================== Dedupe / Idempotence Tests ====================

#[tokio::test]
async fn test_concurrent_attempts_share_one_backend_run() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::slow("a", Step::Write(4096), Duration::from_millis(100));
    let orchestrator = orchestrator(
        &[backend.clone()],
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );
    let track = Track::in_folder("spotify:track:dup", "Twice", "Artist", dir.path());
    let options = AttemptOptions::default();
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        orchestrator.attempt(&track, &options, &cancel),
        orchestrator.attempt(&track, &options, &cancel),
    );

    assert!(first.is_success());
    assert_eq!(first, second);
    assert_eq!(backend.calls(), 1);
    assert_eq!(orchestrator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_repeat_attempt_after_success_reuses_file() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new("a", Step::Write(4096));
    let orchestrator = orchestrator(
        &[backend.clone()],
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );
    let track = Track::in_folder("spotify:track:once", "Once", "Artist", dir.path());
    let cancel = CancellationToken::new();

    let first = orchestrator.attempt(&track, &AttemptOptions::default(), &cancel).await;
    let again = orchestrator.attempt(&track, &AttemptOptions::default(), &cancel).await;

    assert_eq!(first.path(), again.path());
    assert!(matches!(again, Outcome::Success { backend: None, .. }));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_touches_no_backend() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new("a", Step::Write(4096));
    let orchestrator = orchestrator(
        &[backend.clone()],
        memory_store().await,
        IntegrityChecker::new(test_policy()),
        fast_config(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = orchestrator
        .attempt(
            &Track::in_folder("spotify:track:c", "C", "Artist", dir.path()),
            &AttemptOptions::default(),
            &cancel,
        )
        .await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(backend.calls(), 0);
}
