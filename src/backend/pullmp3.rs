//! PullMp3: WordPress ajax converter keyed by YouTube video id.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use super::candidate::{youtube_source, youtube_video_id};
use super::{Backend, BackendError, BackendKind, Capabilities, FetchRequest, FetchedFile};
use crate::download::{DownloadError, HttpClient};
use crate::playlist::Track;

const AJAX_PATH: &str = "/wp-admin/admin-ajax.php";

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    status: Option<String>,
    link: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PullMp3Backend {
    client: HttpClient,
    base_url: String,
}

impl PullMp3Backend {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn convert_url(&self, video_id: &str) -> Result<String, BackendError> {
        let raw = format!("{}{AJAX_PATH}", self.base_url);
        let mut url = Url::parse(&raw)
            .map_err(|_| BackendError::http(self.name(), DownloadError::invalid_url(&raw)))?;
        url.query_pairs_mut()
            .append_pair("action", "convert_youtube")
            .append_pair("video_id", video_id)
            .append_pair("quality", "320");
        Ok(url.into())
    }
}

#[async_trait]
impl Backend for PullMp3Backend {
    fn name(&self) -> &str {
        BackendKind::PullMp3.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_url: true,
            metadata_search: false,
        }
    }

    fn supports(&self, track: &Track) -> bool {
        youtube_source(track).is_some()
    }

    #[instrument(skip(self, request), fields(track_id = request.track.id(), proxy = %request.proxy))]
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedFile, BackendError> {
        let name = self.name();
        let source = youtube_source(request.track)
            .ok_or_else(|| BackendError::unsupported(name, "no YouTube candidate"))?;
        let video_id = youtube_video_id(&source)
            .ok_or_else(|| BackendError::unsupported(name, "no YouTube video id"))?;

        let convert_url = self.convert_url(video_id)?;
        let response: ConvertResponse = self
            .client
            .get_json(&convert_url, request.proxy)
            .await
            .map_err(|e| BackendError::http(name, e))?;

        let link = match (response.status.as_deref(), response.link) {
            (Some("ok"), Some(link)) if !link.is_empty() => link,
            (Some("ok"), _) => return Err(BackendError::no_output(name)),
            (Some("error"), _) => {
                return Err(BackendError::rejected(
                    name,
                    response.message.unwrap_or_else(|| "conversion refused".to_string()),
                ));
            }
            (status, _) => {
                return Err(BackendError::unavailable(
                    name,
                    format!("conversion status {}", status.unwrap_or("missing")),
                ));
            }
        };

        let bytes = self
            .client
            .download_to_path(&link, request.staging_path, request.proxy)
            .await
            .map_err(|e| BackendError::http(name, e))?;
        Ok(FetchedFile {
            path: request.staging_path.to_path_buf(),
            bytes,
        })
    }
}
