//! Alternate-source lookup: finds YouTube candidates for tracks that only
//! carry a Spotify reference, so the converter backends can take them.
//!
//! - [`TubetifyLookup`] - Spotify URL to YouTube matches via tubetify
//! - [`YtSearchLookup`] - `yt-dlp ytsearchN:` metadata search

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::candidate::spotify_track_url;
use super::process::ToolCommand;
use super::BackendError;
use crate::download::HttpClient;
use crate::playlist::{SourceCandidate, Track};

/// Results requested from a `ytsearch` query.
pub const DEFAULT_SEARCH_RESULTS: usize = 5;

#[allow(clippy::expect_used)]
static YOUTU_BE_ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a\s[^>]*href="(https://youtu\.be/[A-Za-z0-9_-]{11})/?"[^>]*>"#)
        .expect("anchor regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TITLE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"title="([^"]*)""#).expect("title regex is valid") // Static pattern, safe to panic
});

/// A service that proposes alternate sources for a track.
#[async_trait]
pub trait CandidateLookup: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this lookup can say anything about `track`.
    fn applies_to(&self, track: &Track) -> bool;

    /// Candidates in the service's own ranking order; may be empty.
    async fn lookup(&self, track: &Track) -> Result<Vec<SourceCandidate>, BackendError>;
}

/// tubetify.com: `GET /convert` opens a session, `POST /generate` with the
/// Spotify URL answers an HTML table of `youtu.be` links.
#[derive(Debug, Clone)]
pub struct TubetifyLookup {
    client: HttpClient,
    base_url: String,
}

impl TubetifyLookup {
    pub const NAME: &'static str = "tubetify";

    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Pulls `youtu.be` links and their titles out of a tubetify result page.
fn parse_tubetify(html: &str) -> Vec<SourceCandidate> {
    let mut seen = std::collections::HashSet::new();
    YOUTU_BE_ANCHOR
        .captures_iter(html)
        .filter_map(|caps| {
            let url = caps.get(1)?.as_str();
            if !seen.insert(url.to_string()) {
                return None;
            }
            let title = caps
                .get(0)
                .and_then(|tag| TITLE_ATTR.captures(tag.as_str()))
                .and_then(|t| t.get(1))
                .map_or_else(String::new, |t| unescape_html(t.as_str()));
            Some(SourceCandidate::new(url, title))
        })
        .collect()
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[async_trait]
impl CandidateLookup for TubetifyLookup {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn applies_to(&self, track: &Track) -> bool {
        spotify_track_url(track.id()).is_some()
    }

    #[instrument(skip(self, track), fields(track_id = track.id()))]
    async fn lookup(&self, track: &Track) -> Result<Vec<SourceCandidate>, BackendError> {
        let spotify = spotify_track_url(track.id())
            .ok_or_else(|| BackendError::unsupported(Self::NAME, "not a Spotify track"))?;

        self.client
            .get_text(&format!("{}/convert", self.base_url))
            .await
            .map_err(|e| BackendError::http(Self::NAME, e))?;
        let html = self
            .client
            .post_form_text(
                &format!("{}/generate", self.base_url),
                &[
                    ("spotify-tracks", spotify.as_str()),
                    ("spotify-tracks-send", "Converting, Please Wait..."),
                ],
            )
            .await
            .map_err(|e| BackendError::http(Self::NAME, e))?;

        let candidates = parse_tubetify(&html);
        debug!(found = candidates.len(), "tubetify lookup finished");
        Ok(candidates)
    }
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: Option<f64>,
}

/// `yt-dlp "ytsearchN:Artist - Title" --dump-json --flat-playlist`, one JSON
/// object per result line.
#[derive(Debug, Clone)]
pub struct YtSearchLookup {
    tool: ToolCommand,
    results: usize,
}

impl YtSearchLookup {
    pub const NAME: &'static str = "ytsearch";

    #[must_use]
    pub fn new(tool: ToolCommand) -> Self {
        Self {
            tool,
            results: DEFAULT_SEARCH_RESULTS,
        }
    }

    #[must_use]
    pub fn with_results(mut self, results: usize) -> Self {
        self.results = results.max(1);
        self
    }

    fn args(&self, track: &Track) -> Vec<String> {
        vec![
            format!("ytsearch{}:{}", self.results, track.search_query()),
            "--dump-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
        ]
    }
}

fn parse_search_output(stdout: &str) -> Vec<SourceCandidate> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<SearchEntry>(line).ok())
        .map(|entry| {
            let candidate = SourceCandidate::new(
                format!("https://www.youtube.com/watch?v={}", entry.id),
                entry.title,
            );
            match entry.duration {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Some(secs) if secs.is_finite() && secs >= 0.0 => {
                    candidate.with_duration(secs.round() as u32)
                }
                _ => candidate,
            }
        })
        .collect()
}

#[async_trait]
impl CandidateLookup for YtSearchLookup {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn applies_to(&self, track: &Track) -> bool {
        !track.title().trim().is_empty()
    }

    #[instrument(skip(self, track), fields(track_id = track.id()))]
    async fn lookup(&self, track: &Track) -> Result<Vec<SourceCandidate>, BackendError> {
        let output = self.tool.run(Self::NAME, &self.args(track), None).await?;
        let candidates = parse_search_output(&String::from_utf8_lossy(&output.stdout));
        debug!(found = candidates.len(), "yt-dlp search finished");
        Ok(candidates)
    }
}
