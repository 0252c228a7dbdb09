//! Configuration file loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use tracksync_core::backend::{BackendKind, BackendSettings};
use tracksync_core::playlist::RemovedTrackPolicy;
use tracksync_core::proxy::DEFAULT_REFRESH_INTERVAL;
use tracksync_core::{IntegrityPolicy, OrchestratorConfig, ProxyPolicy, RetryPolicy, SyncConfig};

/// Default song-details service queried for upstream playlists.
pub const DEFAULT_SONG_DETAILS_BASE: &str = "https://spotdown.app";

/// Flat `key = value` configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Root folder new playlists are created under.
    pub music_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub verbosity: Option<VerbositySetting>,
    /// Global concurrent downloads (1..=32).
    pub concurrency: Option<u32>,
    /// Attempts per backend (1..=10).
    pub max_retries: Option<u32>,
    /// Backends tried per track (1..=5).
    pub max_chain_depth: Option<u32>,
    /// Backend order; earlier entries are tried first.
    pub backends: Option<Vec<BackendKind>>,
    pub trip_threshold: Option<u32>,
    pub trip_cooldown_secs: Option<u64>,
    pub tolerance_secs: Option<f64>,
    /// Duration tolerance in percent of the expected length.
    pub tolerance_pct: Option<f64>,
    pub min_file_bytes: Option<u64>,
    pub ffprobe: Option<String>,
    pub proxy_enabled: Option<bool>,
    pub proxy_failure_threshold: Option<u32>,
    pub proxy_cooldown_secs: Option<u64>,
    pub proxy_growth_factor: Option<f64>,
    pub proxy_lists: Option<Vec<String>>,
    pub proxies: Option<Vec<String>>,
    /// Minutes between proxy list refreshes while the daemon runs.
    pub proxy_refresh_minutes: Option<u64>,
    /// URL fetched through each new list proxy before it is pooled.
    pub proxy_check_url: Option<String>,
    /// Look up YouTube alternates for Spotify-only tracks.
    pub source_lookup: Option<bool>,
    pub tubetify_base: Option<String>,
    pub song_details_base: Option<String>,
    pub sync_parallelism: Option<u32>,
    pub auto_download: Option<bool>,
    pub removed_tracks: Option<RemovedTrackPolicy>,
}

impl FileConfig {
    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("concurrency", self.concurrency, 1..=32)?;
        validate_range("max_retries", self.max_retries, 1..=10)?;
        validate_range("max_chain_depth", self.max_chain_depth, 1..=5)?;
        validate_range("trip_threshold", self.trip_threshold, 1..=100)?;
        validate_range("trip_cooldown_secs", self.trip_cooldown_secs, 1..=86_400)?;
        validate_range("proxy_failure_threshold", self.proxy_failure_threshold, 1..=50)?;
        validate_range("proxy_cooldown_secs", self.proxy_cooldown_secs, 1..=86_400)?;
        validate_range("sync_parallelism", self.sync_parallelism, 1..=8)?;
        validate_range("proxy_refresh_minutes", self.proxy_refresh_minutes, 5..=1440)?;
        validate_float("tolerance_secs", self.tolerance_secs, 0.0, 60.0)?;
        validate_float("tolerance_pct", self.tolerance_pct, 0.0, 50.0)?;
        validate_float("proxy_growth_factor", self.proxy_growth_factor, 1.0, 10.0)?;
        if let Some(backends) = &self.backends
            && backends.is_empty()
        {
            bail!("Invalid config value for `backends`: at least one backend is required");
        }
        Ok(())
    }

    /// Backend order as `(kind, priority)` pairs, or the built-in table.
    #[must_use]
    pub fn backend_priorities(&self) -> Vec<(BackendKind, u32)> {
        match &self.backends {
            Some(kinds) => kinds
                .iter()
                .zip(0u32..)
                .map(|(kind, priority)| (*kind, priority))
                .collect(),
            None => BackendKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_priority()))
                .collect(),
        }
    }

    #[must_use]
    pub fn integrity_policy(&self) -> IntegrityPolicy {
        let mut policy = IntegrityPolicy::default();
        if let Some(secs) = self.tolerance_secs {
            policy.tolerance_secs = secs;
        }
        if let Some(pct) = self.tolerance_pct {
            policy.tolerance_pct = pct / 100.0;
        }
        if let Some(bytes) = self.min_file_bytes {
            policy.min_bytes = bytes;
        }
        policy
    }

    #[must_use]
    pub fn proxy_policy(&self) -> ProxyPolicy {
        let mut policy = ProxyPolicy::default();
        if let Some(enabled) = self.proxy_enabled {
            policy.enabled = enabled;
        }
        if let Some(threshold) = self.proxy_failure_threshold {
            policy.failure_threshold = threshold;
        }
        if let Some(secs) = self.proxy_cooldown_secs {
            policy.base_cooldown = Duration::from_secs(secs);
        }
        if let Some(factor) = self.proxy_growth_factor {
            policy.growth_factor = factor;
        }
        policy
    }

    /// How often the daemon refreshes proxy lists.
    #[must_use]
    pub fn proxy_refresh_interval(&self) -> Duration {
        self.proxy_refresh_minutes
            .map_or(DEFAULT_REFRESH_INTERVAL, |minutes| Duration::from_secs(minutes * 60))
    }

    #[must_use]
    pub fn backend_settings(&self) -> BackendSettings {
        let mut settings = BackendSettings::default();
        if let Some(base) = &self.tubetify_base {
            settings.tubetify_base.clone_from(base);
        }
        settings
    }

    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        if let Some(n) = self.concurrency {
            config.concurrency = n as usize;
        }
        if let Some(n) = self.max_chain_depth {
            config.max_chain_depth = Some(n as usize);
        }
        if let Some(n) = self.trip_threshold {
            config.trip_threshold = n;
        }
        if let Some(secs) = self.trip_cooldown_secs {
            config.trip_cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_retries {
            config.retry = RetryPolicy::with_max_attempts(n);
        }
        config
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        if let Some(n) = self.sync_parallelism {
            config.parallelism = n as usize;
        }
        if let Some(auto) = self.auto_download {
            config.auto_download = auto;
        }
        if let Some(policy) = self.removed_tracks {
            config.removed_tracks = policy;
        }
        config
    }
}

fn validate_range<T>(field: &str, value: Option<T>, range: std::ops::RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

fn validate_float(field: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !value.is_finite() || value < min || value > max {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Tracing filter used when neither `RUST_LOG` nor a CLI flag decides.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub config: FileConfig,
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/tracksync/config.toml`
/// 2. `$HOME/.config/tracksync/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("tracksync").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("tracksync")
            .join("config.toml"),
    )
}

/// Default data directory for the database and its backups.
#[must_use]
pub fn resolve_data_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("tracksync");
    }
    env_var_non_empty_os("HOME").map_or_else(
        || PathBuf::from(".tracksync"),
        |home| PathBuf::from(home).join(".local").join("share").join("tracksync"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), else the default path if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: load_file_config(path)?,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(path_ref) if path_ref.exists() => {
            let config = load_file_config(path_ref)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: FileConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "music_dir" => cfg.music_dir = Some(parse_string_literal(value).with_context(invalid)?.into()),
            "db_path" => cfg.db_path = Some(parse_string_literal(value).with_context(invalid)?.into()),
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(invalid)?);
            }
            "concurrency" => cfg.concurrency = Some(parse_u32(value).with_context(invalid)?),
            "max_retries" => cfg.max_retries = Some(parse_u32(value).with_context(invalid)?),
            "max_chain_depth" => cfg.max_chain_depth = Some(parse_u32(value).with_context(invalid)?),
            "backends" => {
                let names = parse_string_array(value).with_context(invalid)?;
                let kinds = names
                    .iter()
                    .map(|name| name.parse::<BackendKind>().map_err(|e| anyhow!(e)))
                    .collect::<Result<Vec<_>>>()
                    .with_context(invalid)?;
                cfg.backends = Some(kinds);
            }
            "trip_threshold" => cfg.trip_threshold = Some(parse_u32(value).with_context(invalid)?),
            "trip_cooldown_secs" => cfg.trip_cooldown_secs = Some(parse_u64(value).with_context(invalid)?),
            "tolerance_secs" => cfg.tolerance_secs = Some(parse_float(value).with_context(invalid)?),
            "tolerance_pct" => cfg.tolerance_pct = Some(parse_float(value).with_context(invalid)?),
            "min_file_bytes" => cfg.min_file_bytes = Some(parse_u64(value).with_context(invalid)?),
            "ffprobe" => cfg.ffprobe = Some(parse_string_literal(value).with_context(invalid)?),
            "proxy_enabled" => cfg.proxy_enabled = Some(parse_boolean(value).with_context(invalid)?),
            "proxy_failure_threshold" => {
                cfg.proxy_failure_threshold = Some(parse_u32(value).with_context(invalid)?);
            }
            "proxy_cooldown_secs" => cfg.proxy_cooldown_secs = Some(parse_u64(value).with_context(invalid)?),
            "proxy_growth_factor" => cfg.proxy_growth_factor = Some(parse_float(value).with_context(invalid)?),
            "proxy_lists" => cfg.proxy_lists = Some(parse_string_array(value).with_context(invalid)?),
            "proxies" => cfg.proxies = Some(parse_string_array(value).with_context(invalid)?),
            "proxy_refresh_minutes" => {
                cfg.proxy_refresh_minutes = Some(parse_u64(value).with_context(invalid)?);
            }
            "proxy_check_url" => cfg.proxy_check_url = Some(parse_string_literal(value).with_context(invalid)?),
            "source_lookup" => cfg.source_lookup = Some(parse_boolean(value).with_context(invalid)?),
            "tubetify_base" => cfg.tubetify_base = Some(parse_string_literal(value).with_context(invalid)?),
            "song_details_base" => {
                cfg.song_details_base = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "sync_parallelism" => cfg.sync_parallelism = Some(parse_u32(value).with_context(invalid)?),
            "auto_download" => cfg.auto_download = Some(parse_boolean(value).with_context(invalid)?),
            "removed_tracks" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.removed_tracks = Some(match parsed.as_str() {
                    "keep" => RemovedTrackPolicy::Keep,
                    "forget" => RemovedTrackPolicy::Forget,
                    _ => bail!("{}: expected \"keep\" or \"forget\"", invalid()),
                });
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_string_array(raw_value: &str) -> Result<Vec<String>> {
    let Some(inner) = raw_value
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        bail!("Expected an array of double-quoted strings");
    };
    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_string_literal)
        .collect()
}

fn parse_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow!("Integer value out of range for u64"))
}

fn parse_u32(raw_value: &str) -> Result<u32> {
    u32::try_from(parse_u64(raw_value)?).map_err(|_| anyhow!("Integer value out of range for u32"))
}

fn parse_float(raw_value: &str) -> Result<f64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected number");
    }
    Ok(token.parse::<f64>()?)
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
