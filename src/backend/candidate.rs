//! Source identifier helpers and alternate-source ranking.

use std::sync::LazyLock;

use regex::Regex;

use crate::playlist::{SourceCandidate, Track};

#[allow(clippy::expect_used)]
static YOUTUBE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?|shorts)/|.*[?&]v=)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .expect("YouTube id regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static SPOTIFY_TRACK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:spotify:track:|https?://open\.spotify\.com/(?:intl-[a-z]+/)?track/)([A-Za-z0-9]{22})")
        .expect("Spotify track regex is valid") // Static pattern, safe to panic
});

/// Extracts the 11-character video id from a YouTube URL.
#[must_use]
pub fn youtube_video_id(url: &str) -> Option<&str> {
    YOUTUBE_ID_PATTERN
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Extracts the base-62 track id from a Spotify URI or URL.
#[must_use]
pub fn spotify_track_id(id: &str) -> Option<&str> {
    SPOTIFY_TRACK_PATTERN
        .captures(id.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Canonical `https://open.spotify.com/track/<id>` form of a Spotify reference.
#[must_use]
pub fn spotify_track_url(id: &str) -> Option<String> {
    spotify_track_id(id).map(|id| format!("https://open.spotify.com/track/{id}"))
}

/// Returns the YouTube URL a converter backend should use for `track`:
/// the track id itself if it is a YouTube URL, else the best candidate.
#[must_use]
pub fn youtube_source(track: &Track) -> Option<String> {
    if youtube_video_id(track.id()).is_some() {
        return Some(track.id().to_string());
    }
    let youtube: Vec<&SourceCandidate> = track
        .candidates()
        .iter()
        .filter(|c| youtube_video_id(&c.url).is_some())
        .collect();
    best_candidate(track, youtube).map(|c| c.url.clone())
}

/// Picks the candidate that best matches the track.
///
/// Title similarity (Jaro-Winkler on lowercase `artist title` versus the
/// candidate title) counts 70%, duration closeness 30%. Candidates without a
/// duration, or tracks without one, score 0.5 on duration.
#[must_use]
pub fn best_candidate<'a, I>(track: &Track, candidates: I) -> Option<&'a SourceCandidate>
where
    I: IntoIterator<Item = &'a SourceCandidate>,
{
    let wanted = format!("{} {}", track.artist(), track.title()).to_lowercase();
    candidates
        .into_iter()
        .map(|c| (candidate_score(&wanted, track.duration_secs(), c), c))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c)
}

fn candidate_score(wanted: &str, expected_secs: Option<u32>, candidate: &SourceCandidate) -> f64 {
    let title = strsim::jaro_winkler(wanted, &candidate.title.to_lowercase());
    let duration = match (expected_secs, candidate.duration_secs) {
        (Some(expected), Some(actual)) if expected > 0 => {
            let delta = f64::from(expected.abs_diff(actual));
            (1.0 - delta / f64::from(expected)).max(0.0)
        }
        _ => 0.5,
    };
    title * 0.7 + duration * 0.3
}
