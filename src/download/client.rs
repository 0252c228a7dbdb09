//! HTTP client wrapper used by the converter backends.
//!
//! Handles streaming a body to a staging file, JSON round trips to
//! conversion APIs, and one pooled `reqwest::Client` per egress proxy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Proxy, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::error::DownloadError;
use crate::proxy::{ProxyAddress, ProxyChoice};

/// Default HTTP connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default whole-request timeout (seconds). Audio bodies are a few MB.
pub const READ_TIMEOUT_SECS: u64 = 180;

/// Browser User-Agent; the converter sites reject obvious bots.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:143.0) Gecko/20100101 Firefox/143.0";

/// Bodies below this size with a text content type are error pages.
const ERROR_PAGE_MAX_BYTES: u64 = 64 * 1024;

/// HTTP client with a lazily-built `reqwest::Client` per proxy.
///
/// Cheap to clone; clones share the connection pools.
#[derive(Debug, Clone)]
pub struct HttpClient {
    direct: Client,
    proxied: Arc<DashMap<String, Client>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if TLS initialisation fails.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if TLS initialisation fails.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let direct = base_builder(connect_timeout, read_timeout)
            .build()
            .map_err(DownloadError::client_build)?;
        Ok(Self {
            direct,
            proxied: Arc::new(DashMap::new()),
            connect_timeout,
            read_timeout,
        })
    }

    /// Returns the pooled client for `proxy`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Proxy`] when the proxy URL is rejected.
    pub fn client_for(&self, proxy: &ProxyChoice) -> Result<Client, DownloadError> {
        let Some(address) = proxy.url() else {
            return Ok(self.direct.clone());
        };
        if let Some(client) = self.proxied.get(&address) {
            return Ok(client.clone());
        }
        let resolved = Proxy::all(&address).map_err(|e| DownloadError::proxy(&address, e))?;
        let client = base_builder(self.connect_timeout, self.read_timeout)
            .proxy(resolved)
            .build()
            .map_err(|e| DownloadError::proxy(&address, e))?;
        self.proxied.insert(address, client.clone());
        Ok(client)
    }

    /// GETs `url` and deserializes a JSON body.
    ///
    /// # Errors
    ///
    /// Network, status and decode failures, each tagged with the URL.
    #[instrument(skip(self, proxy), fields(proxy = %proxy))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        proxy: &ProxyChoice,
    ) -> Result<T, DownloadError> {
        let parsed = parse_url(url)?;
        let client = self.client_for(proxy)?;
        let response = send(client.get(parsed), url).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| DownloadError::decode(url, e))
    }

    /// GETs `url` and returns the body as text.
    ///
    /// # Errors
    ///
    /// Network, status and decode failures, each tagged with the URL.
    #[instrument(skip(self))]
    pub async fn get_text(&self, url: &str) -> Result<String, DownloadError> {
        let parsed = parse_url(url)?;
        let response = send(self.direct.get(parsed), url).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::decode(url, e))
    }

    /// GETs `url` through `proxy` with a throwaway client and short budget.
    /// Used to weed out dead list entries before they enter the pool.
    ///
    /// # Errors
    ///
    /// Proxy, network and status failures, each tagged with the URL.
    #[instrument(skip(self), fields(proxy = %proxy))]
    pub async fn reachable_via(
        &self,
        url: &str,
        proxy: &ProxyAddress,
        budget: Duration,
    ) -> Result<(), DownloadError> {
        let parsed = parse_url(url)?;
        let address = proxy.url();
        let resolved = Proxy::all(&address).map_err(|e| DownloadError::proxy(&address, e))?;
        let client = base_builder(budget, budget)
            .proxy(resolved)
            .build()
            .map_err(|e| DownloadError::proxy(&address, e))?;
        send(client.get(parsed), url).await.map(|_| ())
    }

    /// POSTs `fields` url-encoded and returns the reply as text. Shares the
    /// direct client's cookie jar with [`HttpClient::get_text`].
    ///
    /// # Errors
    ///
    /// Network, status and decode failures, each tagged with the URL.
    #[instrument(skip(self, fields))]
    pub async fn post_form_text(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, DownloadError> {
        let parsed = parse_url(url)?;
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let request = self
            .direct
            .post(parsed)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);
        let response = send(request, url).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::decode(url, e))
    }

    /// POSTs `body` as JSON and deserializes a JSON reply.
    ///
    /// # Errors
    ///
    /// Network, status and decode failures, each tagged with the URL.
    #[instrument(skip(self, body, proxy), fields(proxy = %proxy))]
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        proxy: &ProxyChoice,
    ) -> Result<T, DownloadError> {
        let parsed = parse_url(url)?;
        let client = self.client_for(proxy)?;
        let response = send(client.post(parsed).json(body), url).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| DownloadError::decode(url, e))
    }

    /// Streams a GET body into `dest`, returning the byte count.
    ///
    /// The file is removed again if the transfer fails part way.
    ///
    /// # Errors
    ///
    /// Network, status, IO failures, or an HTML/JSON body where audio
    /// was expected.
    #[instrument(skip(self, proxy), fields(proxy = %proxy, dest = %dest.display()))]
    pub async fn download_to_path(
        &self,
        url: &str,
        dest: &Path,
        proxy: &ProxyChoice,
    ) -> Result<u64, DownloadError> {
        let parsed = parse_url(url)?;
        let client = self.client_for(proxy)?;
        let response = send(client.get(parsed), url).await?;
        save_body(response, url, dest).await
    }

    /// POSTs `body` as JSON and streams the (audio) reply into `dest`.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::download_to_path`].
    #[instrument(skip(self, body, proxy), fields(proxy = %proxy, dest = %dest.display()))]
    pub async fn post_json_to_path(
        &self,
        url: &str,
        body: &serde_json::Value,
        dest: &Path,
        proxy: &ProxyChoice,
    ) -> Result<u64, DownloadError> {
        let parsed = parse_url(url)?;
        let client = self.client_for(proxy)?;
        let response = send(client.post(parsed).json(body), url).await?;
        save_body(response, url, dest).await
    }
}

fn base_builder(connect_timeout: Duration, read_timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .gzip(true)
        .cookie_store(true)
        .user_agent(BROWSER_USER_AGENT)
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    Url::parse(url).map_err(|_| DownloadError::invalid_url(url))
}

async fn send(request: RequestBuilder, url: &str) -> Result<reqwest::Response, DownloadError> {
    let response = request
        .send()
        .await
        .map_err(|e| DownloadError::network(url, e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);
        debug!(status = status.as_u16(), "request rejected");
        return Err(DownloadError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ));
    }
    Ok(response)
}

async fn save_body(
    response: reqwest::Response,
    url: &str,
    dest: &Path,
) -> Result<u64, DownloadError> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if is_error_page_type(&content_type)
        && response
            .content_length()
            .is_none_or(|len| len <= ERROR_PAGE_MAX_BYTES)
    {
        let bytes = response.content_length().unwrap_or(0);
        return Err(DownloadError::unexpected_content(url, content_type, bytes));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    let mut file = File::create(dest)
        .await
        .map_err(|e| DownloadError::io(dest, e))?;

    let result = stream_to_file(&mut file, response, url, dest).await;
    if result.is_err() {
        debug!(path = %dest.display(), "cleaning up partial file after error");
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

fn is_error_page_type(content_type: &str) -> bool {
    content_type.starts_with("text/html") || content_type.starts_with("application/json")
}

async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_download_to_path_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0xFFu8; 4096])
                    .insert_header("content-type", "audio/mpeg"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sub").join("out.mp3");
        let client = HttpClient::new().unwrap();
        let bytes = client
            .download_to_path(&format!("{}/file.mp3", server.uri()), &dest, &ProxyChoice::Direct)
            .await
            .unwrap();
        assert_eq!(bytes, 4096);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_download_to_path_rejects_html_error_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>maintenance</html>")
                    .insert_header("content-type", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp3");
        let err = HttpClient::new()
            .unwrap()
            .download_to_path(&server.uri(), &dest, &ProxyChoice::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UnexpectedContent { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_status_error_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = HttpClient::new()
            .unwrap()
            .download_to_path(&server.uri(), &dir.path().join("x"), &ProxyChoice::Direct)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after_header(), Some("12"));
    }

    #[tokio::test]
    async fn test_post_json_round_trip() {
        #[derive(serde::Deserialize)]
        struct Reply {
            token: String,
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_json(serde_json::json!({"a": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})))
            .mount(&server)
            .await;

        let reply: Reply = HttpClient::new()
            .unwrap()
            .post_json(
                &format!("{}/api/token", server.uri()),
                &serde_json::json!({"a": 1}),
                &ProxyChoice::Direct,
            )
            .await
            .unwrap();
        assert_eq!(reply.token, "t");
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_sending() {
        let err = HttpClient::new()
            .unwrap()
            .get_json::<serde_json::Value>("not a url", &ProxyChoice::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }
}
