//! Track types, status lifecycle and file naming helpers.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a track.
///
/// Written by the orchestrator (download transitions) and the integrity
/// checker (verified/corrupt). Persisted as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Known but not downloaded yet.
    Pending,
    /// An orchestration is in flight.
    Downloading,
    /// A verified file exists at the target path.
    Downloaded,
    /// The last orchestration exhausted every backend.
    Failed,
    /// The file exists but failed verification.
    Corrupt,
    /// The database said downloaded, the filesystem disagrees.
    Missing,
}

impl TrackStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
            Self::Corrupt => "corrupt",
            Self::Missing => "missing",
        }
    }

    /// Returns true when a (re-)download is warranted.
    #[must_use]
    pub fn needs_download(&self) -> bool {
        !matches!(self, Self::Downloaded | Self::Downloading)
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TrackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "failed" => Ok(Self::Failed),
            "corrupt" => Ok(Self::Corrupt),
            "missing" => Ok(Self::Missing),
            _ => Err(format!("invalid track status: {s}")),
        }
    }
}

/// An alternate source for a track (e.g. a matching YouTube upload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    /// Fetchable URL of the candidate.
    pub url: String,
    /// Title reported by the candidate source.
    pub title: String,
    /// Duration reported by the candidate source, in seconds.
    pub duration_secs: Option<u32>,
}

impl SourceCandidate {
    /// Creates a candidate with no duration information.
    #[must_use]
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            duration_secs: None,
        }
    }

    /// Sets the reported duration.
    #[must_use]
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// A single track reference.
///
/// Everything but [`Track::status`] is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    id: String,
    title: String,
    artist: String,
    duration_secs: Option<u32>,
    candidates: Vec<SourceCandidate>,
    target_path: PathBuf,
    status: TrackStatus,
}

impl Track {
    /// Creates a pending track.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        target_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            duration_secs: None,
            candidates: Vec::new(),
            target_path: target_path.into(),
            status: TrackStatus::Pending,
        }
    }

    /// Creates a pending track whose target follows the `Artist - Title.mp3`
    /// convention inside `folder`.
    #[must_use]
    pub fn in_folder(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        folder: &Path,
    ) -> Self {
        let title = title.into();
        let artist = artist.into();
        let target = folder.join(track_file_name(&artist, &title));
        Self::new(id, title, artist, target)
    }

    /// Sets the expected duration.
    #[must_use]
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Sets the alternate-source candidates.
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<SourceCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Sets the initial status (used when rehydrating from the store).
    #[must_use]
    pub fn with_status(mut self, status: TrackStatus) -> Self {
        self.status = status;
        self
    }

    /// Source identifier (URL or ID). Unique within a playlist.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn artist(&self) -> &str {
        &self.artist
    }

    /// Expected duration in seconds, when known.
    #[must_use]
    pub fn duration_secs(&self) -> Option<u32> {
        self.duration_secs
    }

    #[must_use]
    pub fn candidates(&self) -> &[SourceCandidate] {
        &self.candidates
    }

    #[must_use]
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    #[must_use]
    pub fn status(&self) -> TrackStatus {
        self.status
    }

    /// Transitions the track status.
    pub fn set_status(&mut self, status: TrackStatus) {
        self.status = status;
    }

    /// `Artist - Title` search phrase used by metadata-search backends.
    #[must_use]
    pub fn search_query(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// Builds `Artist - Title.mp3` with path-hostile characters replaced.
#[must_use]
pub fn track_file_name(artist: &str, title: &str) -> String {
    format!(
        "{} - {}.mp3",
        sanitize_component(artist),
        sanitize_component(title)
    )
}

/// Replaces characters that are unsafe in file names and trims the result.
///
/// Returns `"Unknown"` for inputs that sanitize to nothing.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parses an `m:ss` or `h:mm:ss` duration label into seconds.
#[must_use]
pub fn parse_duration_label(label: &str) -> Option<u32> {
    let parts: Vec<&str> = label.trim().split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let mut total: u32 = 0;
    for (index, part) in parts.iter().enumerate() {
        let value: u32 = part.trim().parse().ok()?;
        if index > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}
