//! Download backends: independent external services that turn a track
//! reference into an audio file.
//!
//! # Architecture
//!
//! - [`Backend`] - async capability trait every adapter implements
//! - [`BackendKind`] - the closed set of built-in services and their default priority
//! - [`BackendRegistry`] - priority-ordered collection consumed by the orchestrator
//! - [`SpotDownBackend`], [`EzconvBackend`], [`PullMp3Backend`] - HTTP converters
//! - [`YtDlpBackend`], [`SpotDlBackend`] - external downloader processes
//! - [`CandidateLookup`] - finds YouTube alternates for Spotify-only tracks
//!
//! Adapters only write to the staging path they are handed. Verification
//! and the final rename belong to the orchestrator.

mod candidate;
mod error;
mod ezconv;
mod lookup;
mod process;
mod pullmp3;
mod registry;
mod spotdl;
mod spotdown;
mod ytdlp;

pub use candidate::{
    best_candidate, spotify_track_id, spotify_track_url, youtube_source, youtube_video_id,
};
pub use error::BackendError;
pub use ezconv::EzconvBackend;
pub use lookup::{CandidateLookup, DEFAULT_SEARCH_RESULTS, TubetifyLookup, YtSearchLookup};
pub use process::ToolCommand;
pub use pullmp3::PullMp3Backend;
pub use registry::{BackendRegistry, RegisteredBackend};
pub use spotdl::SpotDlBackend;
pub use spotdown::SpotDownBackend;
pub use ytdlp::YtDlpBackend;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::download::HttpClient;
use crate::playlist::Track;
use crate::proxy::ProxyChoice;

/// The built-in backends, in default chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    SpotDown,
    Ezconv,
    PullMp3,
    YtDlp,
    SpotDl,
}

impl BackendKind {
    /// Every built-in backend.
    pub const ALL: [Self; 5] = [
        Self::SpotDown,
        Self::Ezconv,
        Self::PullMp3,
        Self::YtDlp,
        Self::SpotDl,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpotDown => "spotdown",
            Self::Ezconv => "ezconv",
            Self::PullMp3 => "pullmp3",
            Self::YtDlp => "yt-dlp",
            Self::SpotDl => "spotdl",
        }
    }

    /// Rank in the default chain (lower is tried first).
    #[must_use]
    pub fn default_priority(&self) -> u32 {
        match self {
            Self::SpotDown => 0,
            Self::Ezconv => 1,
            Self::PullMp3 => 2,
            Self::YtDlp => 3,
            Self::SpotDl => 4,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotdown" => Ok(Self::SpotDown),
            "ezconv" => Ok(Self::Ezconv),
            "pullmp3" => Ok(Self::PullMp3),
            "yt-dlp" | "ytdlp" => Ok(Self::YtDlp),
            "spotdl" => Ok(Self::SpotDl),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// What kinds of track reference a backend can work from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Works from a source URL/identifier directly.
    pub direct_url: bool,
    /// Can search by `Artist - Title` when no usable URL is known.
    pub metadata_search: bool,
}

/// Everything an adapter needs for one fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub track: &'a Track,
    pub proxy: &'a ProxyChoice,
    /// Where the adapter must leave the audio file. Its parent exists.
    pub staging_path: &'a Path,
}

/// A file an adapter produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// One external download method.
///
/// Uses `async_trait` so the registry can hold `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable name used in logs, config and the download log.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Returns true if this backend can attempt `track` at all.
    fn supports(&self, track: &Track) -> bool;

    /// Produces the audio file at `request.staging_path`.
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedFile, BackendError>;
}

/// Endpoints and tool paths for the built-in backends.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub spotdown_base: String,
    pub ezconv_base: String,
    pub ezconv_api: String,
    pub pullmp3_base: String,
    pub tubetify_base: String,
    pub ytdlp_program: String,
    pub spotdl_program: String,
    /// Time budget for one external tool run.
    pub tool_timeout: std::time::Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            spotdown_base: "https://spotdown.app".to_string(),
            ezconv_base: "https://ezconv.com".to_string(),
            ezconv_api: "https://ds4.ezsrv.net".to_string(),
            pullmp3_base: "https://pullmp3.com".to_string(),
            tubetify_base: "https://tubetify.com".to_string(),
            ytdlp_program: "yt-dlp".to_string(),
            spotdl_program: "spotdl".to_string(),
            tool_timeout: std::time::Duration::from_secs(180),
        }
    }
}

/// Builds one built-in adapter.
#[must_use]
pub fn build_backend(
    kind: BackendKind,
    settings: &BackendSettings,
    client: &HttpClient,
) -> Arc<dyn Backend> {
    match kind {
        BackendKind::SpotDown => Arc::new(SpotDownBackend::new(
            client.clone(),
            settings.spotdown_base.clone(),
        )),
        BackendKind::Ezconv => Arc::new(EzconvBackend::new(
            client.clone(),
            settings.ezconv_base.clone(),
            settings.ezconv_api.clone(),
        )),
        BackendKind::PullMp3 => Arc::new(PullMp3Backend::new(
            client.clone(),
            settings.pullmp3_base.clone(),
        )),
        BackendKind::YtDlp => Arc::new(YtDlpBackend::new(ToolCommand::new(
            settings.ytdlp_program.clone(),
            settings.tool_timeout,
        ))),
        BackendKind::SpotDl => Arc::new(SpotDlBackend::new(ToolCommand::new(
            settings.spotdl_program.clone(),
            settings.tool_timeout,
        ))),
    }
}

/// Builds the default registry: the given kinds at the given priorities
/// (default table when `priorities` has no entry for a kind).
#[must_use]
pub fn build_default_registry(
    kinds: &[BackendKind],
    priorities: &[(BackendKind, u32)],
    settings: &BackendSettings,
    client: &HttpClient,
) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for kind in kinds {
        let priority = priorities
            .iter()
            .find(|(k, _)| k == kind)
            .map_or_else(|| kind.default_priority(), |(_, p)| *p);
        registry.register(build_backend(*kind, settings, client), priority);
    }
    registry
}

/// Builds the candidate lookups tried for tracks without a YouTube source:
/// tubetify first, then a `yt-dlp` metadata search.
#[must_use]
pub fn build_default_lookups(
    settings: &BackendSettings,
    client: &HttpClient,
) -> Vec<Arc<dyn CandidateLookup>> {
    vec![
        Arc::new(TubetifyLookup::new(client.clone(), settings.tubetify_base.clone())),
        Arc::new(YtSearchLookup::new(ToolCommand::new(
            settings.ytdlp_program.clone(),
            settings.tool_timeout,
        ))),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_round_trip() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("YTDLP".parse::<BackendKind>().unwrap(), BackendKind::YtDlp);
        assert!("napster".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_default_priorities_follow_declaration_order() {
        let priorities: Vec<u32> = BackendKind::ALL.iter().map(BackendKind::default_priority).collect();
        assert_eq!(priorities, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_build_default_registry_applies_overrides() {
        let client = HttpClient::new().unwrap();
        let registry = build_default_registry(
            &BackendKind::ALL,
            &[(BackendKind::SpotDl, 0), (BackendKind::SpotDown, 9)],
            &BackendSettings::default(),
            &client,
        );
        let names: Vec<&str> = registry.ordered().iter().map(|b| b.name()).collect();
        assert_eq!(names.first(), Some(&"spotdl"));
        assert_eq!(names.last(), Some(&"spotdown"));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_default_lookups_try_tubetify_first() {
        let lookups = build_default_lookups(&BackendSettings::default(), &HttpClient::new().unwrap());
        let names: Vec<&str> = lookups.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["tubetify", "ytsearch"]);
    }
}
