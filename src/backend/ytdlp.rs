//! yt-dlp: YouTube download or `ytsearch1:` metadata search, extracted to mp3.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::candidate::youtube_source;
use super::process::ToolCommand;
use super::{Backend, BackendError, BackendKind, Capabilities, FetchRequest, FetchedFile};
use crate::playlist::Track;
use crate::proxy::ProxyChoice;

#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    tool: ToolCommand,
}

impl YtDlpBackend {
    #[must_use]
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    /// YouTube URL when known, otherwise a single-result search.
    fn target(track: &Track) -> String {
        youtube_source(track).unwrap_or_else(|| format!("ytsearch1:{}", track.search_query()))
    }

    fn args(target: &str, staging: &Path, proxy: &ProxyChoice) -> Vec<String> {
        let mut args: Vec<String> = [
            "-x",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "192K",
            "-f",
            "bestaudio/best",
            "--no-playlist",
            "--no-progress",
            "--quiet",
            "--no-warnings",
            "--force-overwrites",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        args.push("-o".to_string());
        args.push(format!("{}.%(ext)s", staging.display()));
        if let Some(proxy_url) = proxy.url() {
            args.push("--proxy".to_string());
            args.push(proxy_url);
        }
        args.push(target.to_string());
        args
    }
}

/// Finds what the tool wrote for `staging`: `<staging>.mp3` or any
/// `<staging>.*` sibling.
async fn locate_output(backend: &str, staging: &Path) -> Result<PathBuf, BackendError> {
    let expected = PathBuf::from(format!("{}.mp3", staging.display()));
    if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
        return Ok(expected);
    }
    let (Some(parent), Some(stem)) = (staging.parent(), staging.file_name()) else {
        return Err(BackendError::no_output(backend));
    };
    let prefix = format!("{}.", stem.to_string_lossy());
    let mut entries = tokio::fs::read_dir(parent)
        .await
        .map_err(|e| BackendError::io(backend, parent, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackendError::io(backend, parent, e))?
    {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(entry.path());
        }
    }
    Err(BackendError::no_output(backend))
}

#[async_trait]
impl Backend for YtDlpBackend {
    fn name(&self) -> &str {
        BackendKind::YtDlp.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_url: true,
            metadata_search: true,
        }
    }

    fn supports(&self, track: &Track) -> bool {
        youtube_source(track).is_some() || !track.title().trim().is_empty()
    }

    #[instrument(skip(self, request), fields(track_id = request.track.id(), proxy = %request.proxy))]
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedFile, BackendError> {
        let name = self.name();
        let target = Self::target(request.track);
        debug!(target = %target, "running yt-dlp");
        let args = Self::args(&target, request.staging_path, request.proxy);
        self.tool.run(name, &args, None).await?;

        let produced = locate_output(name, request.staging_path).await?;
        tokio::fs::rename(&produced, request.staging_path)
            .await
            .map_err(|e| BackendError::io(name, &produced, e))?;
        let bytes = tokio::fs::metadata(request.staging_path)
            .await
            .map_err(|e| BackendError::io(name, request.staging_path, e))?
            .len();
        Ok(FetchedFile {
            path: request.staging_path.to_path_buf(),
            bytes,
        })
    }
}
