//! spotdl: resolves a Spotify track itself and writes an mp3 into a work dir.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::candidate::spotify_track_url;
use super::process::ToolCommand;
use super::{Backend, BackendError, BackendKind, Capabilities, FetchRequest, FetchedFile};
use crate::playlist::Track;
use crate::proxy::ProxyChoice;

#[derive(Debug, Clone)]
pub struct SpotDlBackend {
    tool: ToolCommand,
}

impl SpotDlBackend {
    #[must_use]
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    fn args(track_url: &str, proxy: &ProxyChoice) -> Vec<String> {
        let mut args: Vec<String> = [
            "download",
            track_url,
            "--format",
            "mp3",
            "--bitrate",
            "320k",
            "--threads",
            "1",
            "--overwrite",
            "skip",
            "--simple-tui",
            "--no-cache",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        if let Some(proxy_url) = proxy.url() {
            args.push("--proxy".to_string());
            args.push(proxy_url);
        }
        args
    }

    async fn run_in(
        &self,
        work_dir: &Path,
        track_url: &str,
        proxy: &ProxyChoice,
        staging: &Path,
    ) -> Result<FetchedFile, BackendError> {
        let name = self.name();
        self.tool
            .run(name, &Self::args(track_url, proxy), Some(work_dir))
            .await?;
        let produced = newest_mp3(name, work_dir).await?;
        debug!(file = %produced.display(), "spotdl output found");
        tokio::fs::rename(&produced, staging)
            .await
            .map_err(|e| BackendError::io(name, &produced, e))?;
        let bytes = tokio::fs::metadata(staging)
            .await
            .map_err(|e| BackendError::io(name, staging, e))?
            .len();
        Ok(FetchedFile {
            path: staging.to_path_buf(),
            bytes,
        })
    }
}

/// Work directory next to the staging file, so the final rename stays on
/// one filesystem.
fn work_dir_for(staging: &Path) -> PathBuf {
    let mut name = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".spotdl");
    staging.with_file_name(name)
}

async fn newest_mp3(backend: &str, dir: &Path) -> Result<PathBuf, BackendError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| BackendError::io(backend, dir, e))?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackendError::io(backend, dir, e))?
    {
        let path = entry.path();
        if path
            .extension()
            .is_none_or(|ext| !ext.eq_ignore_ascii_case("mp3"))
        {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(at, _)| modified > *at) {
            newest = Some((modified, path));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| BackendError::no_output(backend))
}

#[async_trait]
impl Backend for SpotDlBackend {
    fn name(&self) -> &str {
        BackendKind::SpotDl.as_str()
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
        let track_url = spotify_track_url(request.track.id())
            .ok_or_else(|| BackendError::unsupported(name, "not a Spotify track"))?;

        let work_dir = work_dir_for(request.staging_path);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| BackendError::io(name, &work_dir, e))?;

        let result = self
            .run_in(&work_dir, &track_url, request.proxy, request.staging_path)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(dir = %work_dir.display(), error = %e, "could not remove spotdl work dir");
        }
        result
    }
}
