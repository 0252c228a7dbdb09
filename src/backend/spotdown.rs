//! SpotDown: a direct API that answers a Spotify track URL with the audio body.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};

use super::{Backend, BackendError, BackendKind, Capabilities, FetchRequest, FetchedFile};
use super::candidate::spotify_track_url;
use crate::download::HttpClient;
use crate::playlist::Track;

#[derive(Debug, Clone)]
pub struct SpotDownBackend {
    client: HttpClient,
    base_url: String,
}

impl SpotDownBackend {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Backend for SpotDownBackend {
    fn name(&self) -> &str {
        BackendKind::SpotDown.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_url: true,
            metadata_search: false,
        }
    }

    fn supports(&self, track: &Track) -> bool {
        spotify_track_url(track.id()).is_some()
    }

    #[instrument(skip(self, request), fields(track_id = request.track.id(), proxy = %request.proxy))]
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedFile, BackendError> {
        let name = self.name();
        let Some(track_url) = spotify_track_url(request.track.id()) else {
            return Err(BackendError::unsupported(name, "not a Spotify track"));
        };
        let endpoint = format!("{}/api/download", self.base_url);
        let bytes = self
            .client
            .post_json_to_path(
                &endpoint,
                &json!({ "url": track_url }),
                request.staging_path,
                request.proxy,
            )
            .await
            .map_err(|e| BackendError::http(name, e))?;
        debug!(bytes, "spotdown body saved");
        Ok(FetchedFile {
            path: request.staging_path.to_path_buf(),
            bytes,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::download::{FailureType, Retryable};
    use crate::proxy::ProxyChoice;

    const TRACK: &str = "spotify:track:4uLU6hMCjMI75M1A2tKUQC";

    fn track() -> Track {
        Track::new(TRACK, "Title", "Artist", "/unused.mp3")
    }

    #[test]
    fn test_supports_only_spotify_tracks() {
        let backend = SpotDownBackend::new(HttpClient::new().unwrap(), "https://x");
        assert!(backend.supports(&track()));
        assert!(!backend.supports(&Track::new("https://youtu.be/dQw4w9WgXcQ", "t", "a", "/x")));
    }

    #[tokio::test]
    async fn test_fetch_posts_track_url_and_saves_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/download"))
            .and(body_json(json!({
                "url": "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0xFFu8; 2048])
                    .insert_header("content-type", "audio/mpeg"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("t.part");
        let backend = SpotDownBackend::new(HttpClient::new().unwrap(), format!("{}/", server.uri()));
        let track = track();
        let fetched = backend
            .fetch(FetchRequest {
                track: &track,
                proxy: &ProxyChoice::Direct,
                staging_path: &staging,
            })
            .await
            .unwrap();
        assert_eq!(fetched.bytes, 2048);
        assert_eq!(fetched.path, staging);
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("t.part");
        let backend = SpotDownBackend::new(HttpClient::new().unwrap(), server.uri());
        let track = track();
        let err = backend
            .fetch(FetchRequest {
                track: &track,
                proxy: &ProxyChoice::Direct,
                staging_path: &staging,
            })
            .await
            .unwrap_err();
        assert_eq!(err.failure_type(), FailureType::RateLimited);
        assert!(!staging.exists());
    }
}
