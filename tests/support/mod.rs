//! Shared fakes for integration tests: scripted backends, a canned upstream
//! source and an in-memory store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tracksync_core::backend::{
    Backend, BackendError, BackendRegistry, Capabilities, FetchRequest, FetchedFile,
};
use tracksync_core::download::{
    DownloadError, FailureType, Orchestrator, OrchestratorConfig, RetryPolicy,
};
use tracksync_core::integrity::{IntegrityChecker, IntegrityPolicy};
use tracksync_core::playlist::{Playlist, Track};
use tracksync_core::proxy::{ProxyManager, ProxyPolicy};
use tracksync_core::store::{PlaylistStore, SqliteStore};
use tracksync_core::sync::{PlaylistSource, SourceError};
use tracksync_core::Database;

/// What a scripted backend does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Writes an ID3-tagged file of this many bytes.
    Write(usize),
    /// Writes a zero-byte file.
    Empty,
    Fail(FailureType),
}

/// Backend that replays a script, then repeats its fallback step.
pub struct ScriptedBackend {
    name: &'static str,
    calls: AtomicU32,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    /// Track ids always rejected as not found.
    rejects: Vec<String>,
}

impl ScriptedBackend {
    pub fn new(name: &'static str, fallback: Step) -> Arc<Self> {
        Self::scripted(name, Vec::new(), fallback)
    }

    pub fn scripted(name: &'static str, script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicU32::new(0),
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            rejects: Vec::new(),
        })
    }

    /// Writes good files except for `rejects`, which fail permanently.
    pub fn rejecting(name: &'static str, rejects: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Write(4096),
            delay: Duration::ZERO,
            rejects: rejects.iter().map(ToString::to_string).collect(),
        })
    }

    pub fn slow(name: &'static str, fallback: Step, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay,
            rejects: Vec::new(),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_url: true,
            metadata_search: true,
        }
    }

    fn supports(&self, _track: &Track) -> bool {
        true
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedFile, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.rejects.iter().any(|id| id == request.track.id()) {
            return Err(BackendError::rejected(self.name, "track not found"));
        }
        let bytes = match self.next_step() {
            Step::Write(len) => audio_bytes(len),
            Step::Empty => Vec::new(),
            Step::Fail(FailureType::Transient) => {
                return Err(BackendError::unavailable(self.name, "503 from service"));
            }
            Step::Fail(FailureType::RateLimited) => {
                return Err(BackendError::http(
                    self.name,
                    DownloadError::http_status("https://service.test/api", 429),
                ));
            }
            Step::Fail(FailureType::AuthExpired) => {
                return Err(BackendError::auth(self.name, "token expired"));
            }
            Step::Fail(FailureType::Permanent) => {
                return Err(BackendError::rejected(self.name, "track not found"));
            }
        };
        tokio::fs::write(request.staging_path, &bytes)
            .await
            .map_err(|e| BackendError::io(self.name, request.staging_path, e))?;
        Ok(FetchedFile {
            path: request.staging_path.to_path_buf(),
            bytes: bytes.len() as u64,
        })
    }
}

/// ID3-tagged filler of `len` bytes.
pub fn audio_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"ID3\x04\x00".to_vec();
    bytes.resize(len.max(bytes.len()), 0x55);
    bytes
}

/// Small files are acceptable so tests do not write megabytes.
pub fn test_policy() -> IntegrityPolicy {
    IntegrityPolicy {
        min_bytes: 64,
        min_bitrate_kbps: 0,
        ..IntegrityPolicy::default()
    }
}

/// No rate limiting, two quick attempts per backend.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        rate_refill: Duration::ZERO,
        retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5))
            .without_jitter(),
        ..OrchestratorConfig::default()
    }
}

pub async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(
        Database::new_in_memory().await.expect("in-memory database"),
    ))
}

/// Registers `backends` in slice order and builds an orchestrator.
pub fn orchestrator(
    backends: &[Arc<ScriptedBackend>],
    store: Arc<dyn PlaylistStore>,
    checker: IntegrityChecker,
    config: OrchestratorConfig,
) -> Orchestrator {
    let mut registry = BackendRegistry::new();
    for (priority, backend) in (0u32..).zip(backends) {
        registry.register(Arc::clone(backend) as Arc<dyn Backend>, priority);
    }
    Orchestrator::new(
        registry,
        Arc::new(ProxyManager::new(ProxyPolicy::default())),
        checker,
        store,
        config,
    )
    .expect("valid orchestrator")
}

/// Upstream source answering from a fixed table keyed by playlist id.
#[derive(Default)]
pub struct CannedSource {
    lists: Mutex<HashMap<String, Vec<(String, String, String)>>>,
    fetches: Mutex<Vec<String>>,
}

impl CannedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the upstream list as `(id, title, artist)` triples.
    pub fn set(&self, playlist_id: &str, tracks: Vec<(String, String, String)>) {
        self.lists
            .lock()
            .unwrap()
            .insert(playlist_id.to_string(), tracks);
    }

    /// Playlist ids fetched so far, in call order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaylistSource for CannedSource {
    async fn fetch_tracks(&self, playlist: &Playlist) -> Result<Vec<Track>, SourceError> {
        self.fetches
            .lock()
            .unwrap()
            .push(playlist.id().to_string());
        let lists = self.lists.lock().unwrap();
        let Some(list) = lists.get(playlist.id()) else {
            return Err(SourceError::NoUpstream(playlist.name().to_string()));
        };
        Ok(list
            .iter()
            .map(|(id, title, artist)| {
                Track::in_folder(id.clone(), title.clone(), artist.clone(), playlist.folder())
            })
            .collect())
    }
}

/// `n` upstream triples `track:<i>` / `Song <i>` / `Artist`.
pub fn upstream_tracks(range: std::ops::Range<usize>) -> Vec<(String, String, String)> {
    range
        .map(|i| (format!("track:{i}"), format!("Song {i}"), "Artist".to_string()))
        .collect()
}
