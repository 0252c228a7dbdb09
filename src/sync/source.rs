//! Upstream track lists.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::{DownloadError, HttpClient};
use crate::playlist::{Playlist, Track, parse_duration_label};
use crate::proxy::ProxyChoice;

/// Why an upstream track list could not be fetched.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("playlist {0} has no upstream url")]
    NoUpstream(String),

    #[error("upstream request failed: {0}")]
    Http(#[from] DownloadError),

    #[error("upstream answer has no track list")]
    Malformed,
}

/// Where a syncable playlist's current track list comes from.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Current upstream tracks, targeted into `playlist`'s folder.
    async fn fetch_tracks(&self, playlist: &Playlist) -> Result<Vec<Track>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SongDetails {
    songs: Option<Vec<Song>>,
}

#[derive(Debug, Deserialize)]
struct Song {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// `GET {base}/api/song-details?url=<upstream url>`.
#[derive(Debug, Clone)]
pub struct SongDetailsSource {
    client: HttpClient,
    base_url: String,
}

impl SongDetailsSource {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn details_url(&self, upstream: &str) -> String {
        format!(
            "{}/api/song-details?url={}",
            self.base_url,
            urlencoding::encode(upstream)
        )
    }
}

#[async_trait]
impl PlaylistSource for SongDetailsSource {
    #[instrument(skip_all, fields(playlist = %playlist.name()))]
    async fn fetch_tracks(&self, playlist: &Playlist) -> Result<Vec<Track>, SourceError> {
        let upstream = playlist
            .source_url()
            .ok_or_else(|| SourceError::NoUpstream(playlist.name().to_string()))?;
        let details: SongDetails = self
            .client
            .get_json(&self.details_url(upstream), &ProxyChoice::Direct)
            .await?;
        let songs = details.songs.ok_or(SourceError::Malformed)?;

        let tracks: Vec<Track> = songs
            .into_iter()
            .filter_map(|song| {
                let url = song.url.filter(|u| !u.trim().is_empty())?;
                let title = song.title.unwrap_or_else(|| "Unknown".to_string());
                let artist = song.artist.unwrap_or_else(|| "Unknown".to_string());
                let track = Track::in_folder(url, title, artist, playlist.folder());
                Some(match song.duration.as_deref().and_then(parse_duration_label) {
                    Some(secs) => track.with_duration(secs),
                    None => track,
                })
            })
            .collect();
        debug!(count = tracks.len(), "fetched upstream tracks");
        Ok(tracks)
    }
}
