//! Download orchestration: drives the backend chain for one track.
//!
//! The [`Orchestrator`] guarantees:
//!
//! - at most one orchestration per track id at a time; concurrent callers
//!   for the same id share the leader's [`Outcome`], and a caller whose
//!   target path or playlist differs gets its own copy and status write
//! - a verified file already at the target path is reused without calling
//!   any backend
//! - adapters write to a staging file; only a verified file is renamed onto
//!   the target path
//! - callers only ever see `Success`, `Failure(kind, detail)` or `Cancelled`
//! - tracks without a YouTube source get candidates from the configured
//!   [`CandidateLookup`]s before the chain is built
//!
//! Cross-track work runs in parallel up to the configured concurrency and a
//! per-backend token bucket.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::attempt::{AttemptRecord, AttemptStep, FailureKind, Outcome, StepOutcome};
use super::health::{BackendHealth, DEFAULT_TRIP_COOLDOWN, DEFAULT_TRIP_THRESHOLD};
use super::rate_limiter::RateLimiter;
use super::retry::{FailureType, RetryError, RetryPolicy, Retryable};
use crate::backend::{
    Backend, BackendError, BackendRegistry, CandidateLookup, FetchRequest, FetchedFile,
    RegisteredBackend, youtube_source,
};
use crate::integrity::IntegrityChecker;
use crate::notify::{Notification, Notifier, TrackFailure};
use crate::playlist::{Track, TrackStatus};
use crate::proxy::ProxyManager;
use crate::store::{DownloadLogEntry, LogOutcome, PlaylistStore, StoreError};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 32;

/// Default number of tracks downloading at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Construction-time validation errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    #[error("no backends registered")]
    NoBackends,
}

/// Orchestrator knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tracks downloading at once.
    pub concurrency: usize,
    /// Consecutive failures that trip a backend's breaker.
    pub trip_threshold: u32,
    /// How long a tripped backend is skipped.
    pub trip_cooldown: Duration,
    /// Default chain cut-off; `None` tries every supporting backend.
    pub max_chain_depth: Option<usize>,
    /// Token-bucket burst per backend.
    pub rate_capacity: u32,
    /// Token refill interval per backend; zero disables rate limiting.
    pub rate_refill: Duration,
    /// Re-run the chain once when a produced file failed verification.
    pub auto_fix: bool,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            trip_threshold: DEFAULT_TRIP_THRESHOLD,
            trip_cooldown: DEFAULT_TRIP_COOLDOWN,
            max_chain_depth: None,
            rate_capacity: 2,
            rate_refill: Duration::from_secs(1),
            auto_fix: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct AttemptOptions {
    /// Playlist whose stored track status and log should be updated.
    pub playlist_id: Option<String>,
    /// Try this backend first, then the rest of the chain.
    pub preferred_backend: Option<String>,
    /// Overrides the configured chain depth (quick-fail contexts).
    pub max_depth: Option<usize>,
}

impl AttemptOptions {
    #[must_use]
    pub fn for_playlist(playlist_id: impl Into<String>) -> Self {
        Self {
            playlist_id: Some(playlist_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_preferred_backend(mut self, backend: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend.into());
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// The running leader for one track id and where it is writing.
#[derive(Clone)]
struct InFlightEntry {
    generation: u64,
    target: PathBuf,
    playlist_id: Option<String>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl InFlightEntry {
    fn serves(&self, track: &Track, options: &AttemptOptions) -> bool {
        self.target == track.target_path() && self.playlist_id == options.playlist_id
    }
}

type InFlight = DashMap<String, InFlightEntry>;

/// Removes the leader's in-flight slot, including when the leader's future is dropped.
struct InFlightGuard<'a> {
    map: &'a InFlight,
    key: &'a str,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(self.key, |_, entry| entry.generation == self.generation);
    }
}

enum Slot {
    Leader(u64, watch::Sender<Option<Outcome>>),
    Follower(InFlightEntry),
}

enum ChainResult {
    Produced { backend: String },
    Exhausted,
    Cancelled,
    Fatal(FailureKind, String),
}

/// Drives the backend chain for tracks.
pub struct Orchestrator {
    registry: BackendRegistry,
    proxies: Arc<ProxyManager>,
    integrity: IntegrityChecker,
    store: Arc<dyn PlaylistStore>,
    notifier: Option<Arc<dyn Notifier>>,
    lookups: Vec<Arc<dyn CandidateLookup>>,
    health: BackendHealth,
    limiter: RateLimiter,
    permits: Semaphore,
    in_flight: InFlight,
    generation: AtomicU64,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] for an out-of-range concurrency or an
    /// empty registry.
    pub fn new(
        registry: BackendRegistry,
        proxies: Arc<ProxyManager>,
        integrity: IntegrityChecker,
        store: Arc<dyn PlaylistStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&config.concurrency) {
            return Err(OrchestratorError::InvalidConcurrency {
                value: config.concurrency,
            });
        }
        if registry.is_empty() {
            return Err(OrchestratorError::NoBackends);
        }
        let limiter = if config.rate_refill.is_zero() {
            RateLimiter::disabled()
        } else {
            RateLimiter::new(config.rate_capacity, config.rate_refill)
        };
        Ok(Self {
            registry,
            proxies,
            integrity,
            store,
            notifier: None,
            lookups: Vec::new(),
            health: BackendHealth::new(config.trip_threshold, config.trip_cooldown),
            limiter,
            permits: Semaphore::new(config.concurrency),
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
            config,
        })
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Adds a candidate lookup; lookups are tried in the order added.
    #[must_use]
    pub fn with_lookup(mut self, lookup: Arc<dyn CandidateLookup>) -> Self {
        self.lookups.push(lookup);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    #[must_use]
    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    #[must_use]
    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PlaylistStore> {
        &self.store
    }

    /// Tracks currently being orchestrated.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Gets `track` onto disk at its target path, or reports why not.
    ///
    /// A concurrent call for the same track id waits for the running call
    /// instead of starting a second chain. When both calls share a target and
    /// playlist the outcome is returned as-is; otherwise the produced file is
    /// copied to this call's target and this call's playlist is updated.
    #[instrument(skip_all, fields(track_id = %track.id()))]
    pub async fn attempt(
        &self,
        track: &Track,
        options: &AttemptOptions,
        cancel: &CancellationToken,
    ) -> Outcome {
        loop {
            let slot = match self.in_flight.entry(track.id().to_string()) {
                Entry::Occupied(entry) => Slot::Follower(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    entry.insert(InFlightEntry {
                        generation,
                        target: track.target_path().to_path_buf(),
                        playlist_id: options.playlist_id.clone(),
                        outcome: rx,
                    });
                    Slot::Leader(generation, tx)
                }
            };

            match slot {
                Slot::Leader(generation, tx) => {
                    let guard = InFlightGuard {
                        map: &self.in_flight,
                        key: track.id(),
                        generation,
                    };
                    let outcome = self.run_exclusive(track, options, cancel).await;
                    // free the slot before publishing so woken followers never see a stale entry
                    drop(guard);
                    tx.send_replace(Some(outcome.clone()));
                    return outcome;
                }
                Slot::Follower(mut entry) => {
                    debug!("joining in-flight attempt");
                    let shared = tokio::select! {
                        () = cancel.cancelled() => return Outcome::Cancelled,
                        result = entry.outcome.wait_for(Option::is_some) => result.ok().and_then(|v| v.clone()),
                    };
                    match shared {
                        Some(Outcome::Cancelled) | None => {}
                        Some(outcome) if entry.serves(track, options) => return outcome,
                        Some(outcome) => return self.adopt(track, options, outcome).await,
                    }
                    // the leader was cancelled; take over
                }
            }
        }
    }

    /// Applies a leader's terminal outcome to a follower with its own target
    /// or playlist.
    async fn adopt(&self, track: &Track, options: &AttemptOptions, leader: Outcome) -> Outcome {
        let previous = track.status();
        let target = track.target_path();
        let outcome = match leader {
            Outcome::Success {
                path,
                backend,
                record,
            } if path != target => match copy_into(&path, target).await {
                Ok(()) => {
                    debug!(from = %path.display(), to = %target.display(), "copied shared download");
                    Outcome::Success {
                        path: target.to_path_buf(),
                        backend,
                        record,
                    }
                }
                Err(e) => Outcome::Failure {
                    kind: FailureKind::Filesystem,
                    detail: format!("cannot copy {} to {}: {e}", path.display(), target.display()),
                    record,
                },
            },
            other => other,
        };
        self.finish(track, options, previous, outcome).await
    }

    async fn run_exclusive(
        &self,
        track: &Track,
        options: &AttemptOptions,
        cancel: &CancellationToken,
    ) -> Outcome {
        let _permit = tokio::select! {
            () = cancel.cancelled() => return Outcome::Cancelled,
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::Cancelled,
            },
        };
        let previous = track.status();
        let target = track.target_path();

        if self.reuse_existing(track).await {
            debug!(path = %target.display(), "verified file already present");
            let outcome = Outcome::Success {
                path: target.to_path_buf(),
                backend: None,
                record: AttemptRecord::new(track.id()),
            };
            return self.finish(track, options, previous, outcome).await;
        }

        let mut record = AttemptRecord::new(track.id());
        if let Some(parent) = target.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            let outcome = Outcome::Failure {
                kind: FailureKind::Filesystem,
                detail: format!("cannot create {}: {e}", parent.display()),
                record,
            };
            return self.finish(track, options, previous, outcome).await;
        }

        if let Some(playlist_id) = options.playlist_id.as_deref()
            && let Err(error) = self
                .write_status(playlist_id, track.id(), TrackStatus::Downloading)
                .await
        {
            let outcome = Outcome::Failure {
                kind: FailureKind::StoreCorruption,
                detail: error.to_string(),
                record,
            };
            self.notify_failure(track, options, &outcome);
            return outcome;
        }

        let resolved = tokio::select! {
            () = cancel.cancelled() => {
                return self.finish(track, options, previous, Outcome::Cancelled).await;
            }
            resolved = self.lookup_candidates(track) => resolved,
        };
        let track = resolved.as_ref().unwrap_or(track);

        let chain = self.registry.chain_for(
            track,
            options.preferred_backend.as_deref(),
            options.max_depth.or(self.config.max_chain_depth),
        );
        if chain.is_empty() {
            let outcome = Outcome::Failure {
                kind: FailureKind::PermanentRejection,
                detail: "no backend supports this track".to_string(),
                record,
            };
            return self.finish(track, options, previous, outcome).await;
        }

        let passes = if self.config.auto_fix { 2 } else { 1 };
        let mut outcome = None;
        for pass in 0..passes {
            let pass_start = record.len();
            match self.run_chain(track, &chain, &mut record, cancel).await {
                ChainResult::Produced { backend } => {
                    info!(backend = %backend, path = %target.display(), "track downloaded");
                    outcome = Some(Outcome::Success {
                        path: target.to_path_buf(),
                        backend: Some(backend),
                        record,
                    });
                    break;
                }
                ChainResult::Cancelled => {
                    outcome = Some(Outcome::Cancelled);
                    break;
                }
                ChainResult::Fatal(kind, detail) => {
                    outcome = Some(Outcome::Failure {
                        kind,
                        detail,
                        record,
                    });
                    break;
                }
                ChainResult::Exhausted => {
                    let defect = record.has_integrity_defect_since(pass_start);
                    if defect && pass + 1 < passes {
                        info!("auto-fix: re-running chain once after integrity defect");
                        continue;
                    }
                    let (kind, detail) = exhaustion_detail(&record, pass_start, defect);
                    outcome = Some(Outcome::Failure {
                        kind,
                        detail,
                        record,
                    });
                    break;
                }
            }
        }
        let outcome = outcome.unwrap_or(Outcome::Cancelled);
        self.finish(track, options, previous, outcome).await
    }

    /// True when the target already holds a verified file. A defective
    /// leftover is removed.
    async fn reuse_existing(&self, track: &Track) -> bool {
        let target = track.target_path();
        if !tokio::fs::try_exists(target).await.unwrap_or(false) {
            return false;
        }
        let verdict = self.integrity.verify(target, track.duration_secs()).await;
        if verdict.is_ok() {
            return true;
        }
        warn!(path = %target.display(), verdict = %verdict, "existing file failed verification; replacing");
        if let Err(e) = tokio::fs::remove_file(target).await {
            warn!(path = %target.display(), error = %e, "could not remove defective file");
        }
        false
    }

    /// Returns `track` with looked-up candidates appended when it has no
    /// YouTube source yet and a lookup found one.
    async fn lookup_candidates(&self, track: &Track) -> Option<Track> {
        if self.lookups.is_empty() || youtube_source(track).is_some() {
            return None;
        }
        for lookup in self.lookups.iter().filter(|l| l.applies_to(track)) {
            match lookup.lookup(track).await {
                Ok(found) if !found.is_empty() => {
                    debug!(lookup = lookup.name(), found = found.len(), "alternate sources found");
                    let mut candidates = track.candidates().to_vec();
                    candidates.extend(found);
                    return Some(track.clone().with_candidates(candidates));
                }
                Ok(_) => debug!(lookup = lookup.name(), "no alternate sources"),
                Err(error) => warn!(lookup = lookup.name(), error = %error, "candidate lookup failed"),
            }
        }
        None
    }

    async fn run_chain(
        &self,
        track: &Track,
        chain: &[&RegisteredBackend],
        record: &mut AttemptRecord,
        cancel: &CancellationToken,
    ) -> ChainResult {
        let staging = staging_path(track.target_path());

        for entry in chain {
            let name = entry.name();
            if self.health.is_tripped(name) {
                debug!(backend = name, "skipping tripped backend");
                record.push(AttemptStep::new(name, "-", StepOutcome::Skipped));
                continue;
            }
            remove_quietly(&staging).await;

            let steps = Mutex::new(Vec::new());
            let result = self
                .config
                .retry
                .run(cancel, |attempt| {
                    self.fetch_once(entry.backend(), track, &staging, attempt, &steps)
                })
                .await;
            for step in steps.into_inner().unwrap_or_else(PoisonError::into_inner) {
                record.push(step);
            }

            match result {
                Ok((fetched, proxy)) => {
                    self.health.record_success(name);
                    let verdict = self
                        .integrity
                        .verify(&fetched.path, track.duration_secs())
                        .await;
                    if verdict.is_ok() {
                        if let Err(e) = tokio::fs::rename(&fetched.path, track.target_path()).await {
                            remove_quietly(&fetched.path).await;
                            return ChainResult::Fatal(
                                FailureKind::Filesystem,
                                format!("cannot move file into {}: {e}", track.target_path().display()),
                            );
                        }
                        record.push(AttemptStep::new(name, proxy, StepOutcome::Success));
                        return ChainResult::Produced {
                            backend: name.to_string(),
                        };
                    }
                    warn!(backend = name, verdict = %verdict, "downloaded file failed verification");
                    remove_quietly(&fetched.path).await;
                    record.push(
                        AttemptStep::new(name, proxy, StepOutcome::IntegrityDefect)
                            .with_detail(verdict.to_string()),
                    );
                }
                Err(RetryError::Cancelled { .. }) => {
                    remove_quietly(&staging).await;
                    return ChainResult::Cancelled;
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    self.health.record_failure(name);
                    warn!(backend = name, attempts, error = %last, "backend gave up; trying next");
                    remove_quietly(&staging).await;
                }
                Err(RetryError::NotRetryable { error, .. }) => {
                    warn!(backend = name, error = %error, "backend rejected track; trying next");
                    remove_quietly(&staging).await;
                }
            }
        }
        ChainResult::Exhausted
    }

    async fn fetch_once(
        &self,
        backend: &Arc<dyn Backend>,
        track: &Track,
        staging: &Path,
        attempt: u32,
        steps: &Mutex<Vec<AttemptStep>>,
    ) -> Result<(FetchedFile, String), BackendError> {
        let name = backend.name();
        let proxy = self.proxies.next(name);
        self.limiter.acquire(name).await;
        debug!(backend = name, proxy = %proxy, attempt, "calling backend");

        let started = Instant::now();
        let result = backend
            .fetch(FetchRequest {
                track,
                proxy: &proxy,
                staging_path: staging,
            })
            .await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => self.proxies.report(name, &proxy, true, latency_ms),
            Err(error) => {
                let failure = error.failure_type();
                if matches!(failure, FailureType::Transient | FailureType::RateLimited) {
                    self.proxies.report(name, &proxy, false, latency_ms);
                }
                if failure == FailureType::RateLimited
                    && let Some(delay) = Retryable::retry_after(error)
                {
                    self.limiter.record_rate_limit(name, delay).await;
                }
                steps
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(
                        AttemptStep::new(name, proxy.to_string(), failure.into())
                            .with_detail(error.to_string()),
                    );
            }
        }
        result.map(|fetched| (fetched, proxy.to_string()))
    }

    /// Status write that only fails on corruption; other store errors are logged.
    async fn write_status(
        &self,
        playlist_id: &str,
        track_id: &str,
        status: TrackStatus,
    ) -> Result<(), StoreError> {
        match self
            .store
            .update_track_status(playlist_id, track_id, status)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if error.is_corruption() => Err(error),
            Err(StoreError::TrackNotFound { .. }) => {
                debug!(playlist = playlist_id, track_id, "track not stored; status not written");
                Ok(())
            }
            Err(error) => {
                warn!(playlist = playlist_id, track_id, error = %error, "could not write track status");
                Ok(())
            }
        }
    }

    /// Store writes and notifications for a terminal outcome.
    async fn finish(
        &self,
        track: &Track,
        options: &AttemptOptions,
        previous: TrackStatus,
        mut outcome: Outcome,
    ) -> Outcome {
        if let Some(playlist_id) = options.playlist_id.as_deref() {
            let (status, log) = match &outcome {
                Outcome::Success { backend: None, .. } => (TrackStatus::Downloaded, None),
                Outcome::Success { .. } => (TrackStatus::Downloaded, Some(LogOutcome::Success)),
                Outcome::Failure { .. } => (TrackStatus::Failed, Some(LogOutcome::Failure)),
                Outcome::Cancelled => (previous, Some(LogOutcome::Cancelled)),
            };

            let skip_write = matches!(outcome, Outcome::Success { backend: None, .. })
                && previous == TrackStatus::Downloaded;
            if !skip_write
                && let Err(error) = self.write_status(playlist_id, track.id(), status).await
            {
                let record = outcome
                    .record()
                    .cloned()
                    .unwrap_or_else(|| AttemptRecord::new(track.id()));
                outcome = Outcome::Failure {
                    kind: FailureKind::StoreCorruption,
                    detail: error.to_string(),
                    record,
                };
            }

            if let Some(log) = log {
                self.log_outcome(playlist_id, track, log, &outcome).await;
            }
        }

        self.notify_failure(track, options, &outcome);
        outcome
    }

    fn notify_failure(&self, track: &Track, options: &AttemptOptions, outcome: &Outcome) {
        let Outcome::Failure { kind, detail, .. } = outcome else {
            return;
        };
        info!(kind = %kind, detail = %detail, "track failed");
        if let Some(notifier) = &self.notifier {
            notifier.notify(Notification::TrackFailed(TrackFailure {
                playlist_id: options.playlist_id.clone(),
                track_id: track.id().to_string(),
                title: track.title().to_string(),
                artist: track.artist().to_string(),
                kind: *kind,
                detail: detail.clone(),
            }));
        }
    }

    async fn log_outcome(&self, playlist_id: &str, track: &Track, log: LogOutcome, outcome: &Outcome) {
        let (backend, file_path, failure_kind) = match outcome {
            Outcome::Success { path, backend, .. } => (backend.as_deref(), Some(path.as_path()), None),
            Outcome::Failure { kind, .. } => (None, None, Some(kind.as_str())),
            Outcome::Cancelled => (None, None, None),
        };
        let steps = outcome.record().map_or(&[][..], AttemptRecord::steps);
        let entry = DownloadLogEntry {
            playlist_id: Some(playlist_id),
            track_id: track.id(),
            outcome: log,
            failure_kind,
            backend,
            file_path,
            attempts: steps,
        };
        if let Err(error) = self.store.record_attempt(&entry).await {
            warn!(error = %error, "could not append download log");
        }
    }
}

fn exhaustion_detail(record: &AttemptRecord, pass_start: usize, defect: bool) -> (FailureKind, String) {
    let tried = record.backends_tried();
    if defect {
        return (
            FailureKind::IntegrityDefect,
            format!("files from {} failed verification", tried.join(", ")),
        );
    }
    let last = record
        .last_failure_since(pass_start)
        .map_or("none", |o| match o {
            StepOutcome::RateLimited => "rate limited",
            StepOutcome::AuthExpired => "authentication rejected",
            StepOutcome::Permanent => "rejected",
            _ => "unavailable",
        });
    (
        FailureKind::AllBackendsExhausted,
        format!("{} backend(s) tried ({}); last failure: {last}", tried.len(), tried.join(", ")),
    )
}

/// `<target>.part`, next to the target.
#[must_use]
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("track"));
    name.push(".part");
    target.with_file_name(name)
}

/// Copies a verified file to `target` through its staging path.
async fn copy_into(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(target);
    if let Err(e) = tokio::fs::copy(source, &staging).await {
        remove_quietly(&staging).await;
        return Err(e);
    }
    tokio::fs::rename(&staging, target).await
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove staging file"),
    }
}
