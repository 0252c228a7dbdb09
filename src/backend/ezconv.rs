//! Ezconv: token, then convert a YouTube URL, then fetch the produced file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::candidate::youtube_source;
use super::{Backend, BackendError, BackendKind, Capabilities, FetchRequest, FetchedFile};
use crate::download::{DownloadError, HttpClient};
use crate::playlist::Track;
use crate::proxy::ProxyChoice;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    status: Option<String>,
    url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Ezconv adapter. The session token is cached until the service rejects it.
#[derive(Debug)]
pub struct EzconvBackend {
    client: HttpClient,
    base_url: String,
    api_url: String,
    token: Mutex<Option<String>>,
}

impl EzconvBackend {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    async fn token(&self, proxy: &ProxyChoice) -> Result<String, BackendError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let url = format!("{}/api/token", self.base_url);
        let response: TokenResponse = self
            .client
            .post_json(&url, &json!({}), proxy)
            .await
            .map_err(|e| BackendError::http(self.name(), e))?;
        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BackendError::auth(self.name(), "no token in response"))?;
        debug!("ezconv token acquired");
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn convert(&self, source: &str, proxy: &ProxyChoice) -> Result<String, BackendError> {
        let token = self.token(proxy).await?;
        let url = format!("{}/api/convert", self.api_url);
        let body = json!({
            "url": source,
            "quality": "320",
            "trim": false,
            "startT": 0,
            "endT": 0,
            "token": token,
        });
        let response: ConvertResponse = match self.client.post_json(&url, &body, proxy).await {
            Ok(response) => response,
            Err(e) if matches!(e.status(), Some(401 | 403)) => {
                self.forget_token().await;
                return Err(BackendError::auth(self.name(), "token rejected"));
            }
            Err(e) => return Err(BackendError::http(self.name(), e)),
        };

        match (response.status.as_deref(), response.url) {
            (Some("done"), Some(link)) if !link.is_empty() => Ok(link),
            (Some("done"), _) => Err(BackendError::no_output(self.name())),
            (status, _) => Err(BackendError::unavailable(
                self.name(),
                response
                    .message
                    .unwrap_or_else(|| format!("conversion status {}", status.unwrap_or("missing"))),
            )),
        }
    }
}

#[async_trait]
impl Backend for EzconvBackend {
    fn name(&self) -> &str {
        BackendKind::Ezconv.as_str()
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
        let Some(source) = youtube_source(request.track) else {
            return Err(BackendError::unsupported(self.name(), "no YouTube candidate"));
        };
        let link = self.convert(&source, request.proxy).await?;
        let bytes = self
            .client
            .download_to_path(&link, request.staging_path, request.proxy)
            .await
            .map_err(|e: DownloadError| BackendError::http(self.name(), e))?;
        Ok(FetchedFile {
            path: request.staging_path.to_path_buf(),
            bytes,
        })
    }
}
