//! Error types for HTTP fetches.
//!
//! These errors carry the URL or path they relate to so that backend
//! adapters can classify and log them without extra bookkeeping.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching a file over HTTP.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429/503 responses).
        retry_after: Option<String>,
    },

    /// File system error while writing the body.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The server answered 200 but the body is not audio.
    #[error("unexpected content from {url}: {content_type} ({bytes} bytes)")]
    UnexpectedContent {
        /// The URL that was fetched.
        url: String,
        /// Reported content type.
        content_type: String,
        /// Body size in bytes.
        bytes: u64,
    },

    /// The reply could not be decoded as the expected JSON shape.
    #[error("malformed response from {url}: {source}")]
    Decode {
        /// The URL that answered.
        url: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP client itself could not be built.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The configured proxy could not be applied to the client.
    #[error("invalid proxy {address}: {source}")]
    Proxy {
        /// Proxy URL as configured.
        address: String,
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            return Self::Timeout { url };
        }
        Self::Network { url, source }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unexpected-content error.
    pub fn unexpected_content(
        url: impl Into<String>,
        content_type: impl Into<String>,
        bytes: u64,
    ) -> Self {
        Self::UnexpectedContent {
            url: url.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Decode {
            url: url.into(),
            source,
        }
    }

    /// Creates a client build error.
    #[must_use]
    pub fn client_build(source: reqwest::Error) -> Self {
        Self::ClientBuild { source }
    }

    /// Creates a proxy configuration error.
    pub fn proxy(address: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Proxy {
            address: address.into(),
            source,
        }
    }

    /// Returns the HTTP status for status errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw Retry-After header value, if the server sent one.
    #[must_use]
    pub fn retry_after_header(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs the
// url or path that the source error does not carry.
