//! CLI entry point for tracksync.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracksync_core::backend::{build_default_lookups, build_default_registry};
use tracksync_core::download::{AttemptOptions, HttpClient, Orchestrator, Outcome};
use tracksync_core::integrity::{self, FfprobeProbe, IntegrityChecker};
use tracksync_core::notify::LogNotifier;
use tracksync_core::playlist::{Playlist, Track, TrackStatus, parse_duration_label, sanitize_component};
use tracksync_core::proxy::{DEFAULT_LIVENESS_TIMEOUT, ProxyManager, ProxySource};
use tracksync_core::service::{CoreHandle, CoreService, DEFAULT_REQUEST_CAPACITY, DownloadRequest, SyncRequest};
use tracksync_core::store::{DeletePolicy, PlaylistStore, SqliteStore, remove_playlist};
use tracksync_core::sync::{SongDetailsSource, SyncEngine, SyncReport, SyncSchedule, last_sync, parse_time, parse_weekday, run_scheduler};
use tracksync_core::{Database, UserFacingFailure};

mod app_config;
mod cli;

use app_config::{DEFAULT_SONG_DETAILS_BASE, FileConfig, load_config, resolve_data_dir};
use cli::{Args, Command, PlaylistCommand};

const DB_FILE_NAME: &str = "tracksync.db";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let loaded = load_config(args.config.as_deref())?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => loaded
                .config
                .verbosity
                .map_or("info", app_config::VerbositySetting::filter),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, config = ?loaded.path, from_file = loaded.loaded_from_file, "starting");
    let config = loaded.config;

    let data_dir = resolve_data_dir();
    let db_path = args
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(|| data_dir.join(DB_FILE_NAME));
    let db = open_database(&db_path).await?;
    let store = Arc::new(SqliteStore::new(db.clone()));

    let code = match args.command {
        Command::Playlist(command) => playlist_command(store.as_ref(), &config, command).await?,
        Command::Schedule {
            day,
            time,
            enable,
            disable,
        } => schedule_command(store.as_ref(), day, time, enable, disable).await?,
        command => {
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping");
                    ctrl_c.cancel();
                }
            });

            let core = Core::build(&config, Arc::clone(&store) as Arc<dyn PlaylistStore>).await?;
            let (service, handle) = CoreService::new(
                Arc::clone(&core.orchestrator),
                Arc::clone(&core.engine),
                DEFAULT_REQUEST_CAPACITY,
                cancel.clone(),
            );
            let service_task = service.spawn();

            let code = core_command(&core, &handle, command, &cancel, &db_path, &db).await;
            cancel.cancel();
            let _ = service_task.await;
            for entry in core.proxies.shutdown() {
                debug!(
                    proxy = %entry.address,
                    ok = entry.success_count,
                    failed = entry.failure_count,
                    blacklisted = entry.blacklisted,
                    "proxy stats"
                );
            }
            code?
        }
    };

    db.close().await;
    Ok(code)
}

/// Opens the database, restoring the newest backup when it is corrupt.
async fn open_database(db_path: &Path) -> Result<Database> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    match Database::new(db_path).await {
        Ok(db) => Ok(db),
        Err(error) if error.is_corruption() => {
            warn!(error = %error, "database is corrupt; restoring latest backup");
            let restored = Database::recover_from_backup(db_path, &backup_dir(db_path))
                .await
                .context("Database is corrupt and could not be restored")?;
            info!(backup = %restored.display(), "database restored");
            Database::new(db_path)
                .await
                .context("Restored database could not be opened")
        }
        Err(error) => Err(error).with_context(|| format!("Failed to open '{}'", db_path.display())),
    }
}

fn backup_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from("backups"), |p| p.join("backups"))
}

/// Long-lived pieces shared by the download, sync and daemon commands.
struct Core {
    client: HttpClient,
    proxies: Arc<ProxyManager>,
    proxy_source: Option<Arc<ProxySource>>,
    orchestrator: Arc<Orchestrator>,
    engine: Arc<SyncEngine>,
}

impl Core {
    async fn build(config: &FileConfig, store: Arc<dyn PlaylistStore>) -> Result<Self> {
        let client = HttpClient::new().context("Failed to build HTTP client")?;

        let proxies = Arc::new(ProxyManager::new(config.proxy_policy()));
        let lists = config.proxy_lists.clone().unwrap_or_default();
        let statics = config.proxies.clone().unwrap_or_default();
        let proxy_source = if lists.is_empty() && statics.is_empty() {
            None
        } else {
            let mut source =
                ProxySource::new(lists, statics).with_min_interval(config.proxy_refresh_interval());
            if let Some(url) = &config.proxy_check_url {
                source = source.with_liveness_check(url.clone(), DEFAULT_LIVENESS_TIMEOUT);
            }
            if let Err(error) = source.refresh(&client, &proxies, true).await {
                warn!(error = %error, "no proxy list could be loaded; downloading directly");
            }
            Some(Arc::new(source))
        };

        let settings = config.backend_settings();
        let priorities = config.backend_priorities();
        let kinds: Vec<_> = priorities.iter().map(|(kind, _)| *kind).collect();
        let registry = build_default_registry(&kinds, &priorities, &settings, &client);

        let probe = config
            .ffprobe
            .as_deref()
            .map_or_else(FfprobeProbe::from_env, FfprobeProbe::new);
        let checker = IntegrityChecker::new(config.integrity_policy()).with_probe(Arc::new(probe));

        let notifier = Arc::new(LogNotifier);
        let mut orchestrator = Orchestrator::new(
            registry,
            Arc::clone(&proxies),
            checker,
            Arc::clone(&store),
            config.orchestrator_config(),
        )?
        .with_notifier(notifier.clone());
        if config.source_lookup.unwrap_or(true) {
            for lookup in build_default_lookups(&settings, &client) {
                orchestrator = orchestrator.with_lookup(lookup);
            }
        }
        let orchestrator = Arc::new(orchestrator);

        let source = SongDetailsSource::new(
            client.clone(),
            config
                .song_details_base
                .clone()
                .unwrap_or_else(|| DEFAULT_SONG_DETAILS_BASE.to_string()),
        );
        let engine = Arc::new(
            SyncEngine::new(
                store,
                Arc::new(source),
                Arc::clone(&orchestrator),
                config.sync_config(),
            )
            .with_notifier(notifier),
        );

        Ok(Self {
            client,
            proxies,
            proxy_source,
            orchestrator,
            engine,
        })
    }
}

async fn find_playlist(store: &dyn PlaylistStore, name: &str) -> Result<Playlist> {
    store
        .find_playlist_by_name(name)
        .await?
        .ok_or_else(|| anyhow!("No playlist named '{name}'"))
}

async fn playlist_command(
    store: &dyn PlaylistStore,
    config: &FileConfig,
    command: PlaylistCommand,
) -> Result<ExitCode> {
    match command {
        PlaylistCommand::Add {
            name,
            url,
            custom,
            folder,
        } => {
            if store.find_playlist_by_name(&name).await?.is_some() {
                bail!("A playlist named '{name}' already exists");
            }
            let folder = folder.unwrap_or_else(|| {
                config
                    .music_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(sanitize_component(&name))
            });
            let id = sanitize_component(&name).to_lowercase();
            let playlist = match (custom, url) {
                (true, _) => Playlist::custom(id, &name, folder),
                (false, Some(url)) => Playlist::syncable(id, &name, folder, url),
                (false, None) => bail!("An upstream URL is required for a syncable playlist"),
            };
            store.save_playlist(&playlist).await?;
            println!("Added '{}' -> {}", playlist.name(), playlist.folder().display());
        }
        PlaylistCommand::List => {
            let playlists = store.load_playlists().await?;
            if playlists.is_empty() {
                println!("No playlists");
            }
            for playlist in playlists {
                let downloaded = playlist
                    .tracks()
                    .iter()
                    .filter(|t| t.status() == TrackStatus::Downloaded)
                    .count();
                let kind = if playlist.is_syncable() { "sync" } else { "custom" };
                let synced = playlist
                    .last_synced_at()
                    .map_or_else(|| "never".to_string(), |at| at.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "{}\t{kind}\t{downloaded}/{} tracks\tlast sync {synced}",
                    playlist.name(),
                    playlist.len()
                );
            }
        }
        PlaylistCommand::Delete { name, delete_files } => {
            let playlist = find_playlist(store, &name).await?;
            let policy = if delete_files {
                DeletePolicy::DeleteFiles
            } else {
                DeletePolicy::KeepFiles
            };
            let removed = remove_playlist(store, playlist.id(), policy).await?;
            println!("Deleted '{name}' ({removed} files removed)");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn schedule_command(
    store: &dyn PlaylistStore,
    day: Option<String>,
    time: Option<String>,
    enable: bool,
    disable: bool,
) -> Result<ExitCode> {
    let mut schedule = SyncSchedule::load(store).await?;
    let changed = day.is_some() || time.is_some() || enable || disable;
    if let Some(day) = day {
        schedule.weekday = parse_weekday(&day)?;
    }
    if let Some(time) = time {
        schedule.time = parse_time(&time)?;
    }
    if enable {
        schedule.enabled = true;
    }
    if disable {
        schedule.enabled = false;
    }
    if changed {
        schedule.save(store).await?;
    }

    let state = if schedule.enabled { "enabled" } else { "disabled" };
    println!(
        "Weekly sync {state}: {} at {}",
        schedule.weekday,
        schedule.time.format("%H:%M")
    );
    if let Some(at) = last_sync(store).await? {
        println!("Last sync: {}", at.format("%Y-%m-%d %H:%M"));
    }
    Ok(ExitCode::SUCCESS)
}

async fn core_command(
    core: &Core,
    handle: &CoreHandle,
    command: Command,
    cancel: &CancellationToken,
    db_path: &Path,
    db: &Database,
) -> Result<ExitCode> {
    let store = core.engine.store().as_ref();
    match command {
        Command::Sync { name: Some(name) } => {
            let playlist = find_playlist(store, &name).await?;
            let report = handle
                .sync(SyncRequest {
                    playlist_id: playlist.id().to_string(),
                })
                .await??;
            print_report(&report);
            Ok(exit_for(report.failed == 0 && !report.cancelled))
        }
        Command::Sync { name: None } => {
            let outcome = handle.sync_all().await??;
            for report in &outcome.reports {
                print_report(report);
            }
            for (name, error) in &outcome.errors {
                eprintln!("{name}: {error}");
            }
            println!(
                "Synced {}/{} playlists, {} new tracks ({} custom playlists skipped)",
                outcome.summary.synced,
                outcome.summary.total,
                outcome.summary.new_tracks,
                outcome.total_custom_excluded
            );
            Ok(exit_for(outcome.summary.errors == 0))
        }
        Command::Download {
            track,
            playlist,
            title,
            artist,
            duration,
            backend,
            max_depth,
        } => {
            let stored = find_playlist(store, &playlist).await?;
            let mut new_track = Track::in_folder(track, title, artist, stored.folder());
            if let Some(secs) = duration.as_deref().and_then(parse_duration_label) {
                new_track = new_track.with_duration(secs);
            }
            let track = match stored.track(new_track.id()) {
                Some(existing) => existing.clone(),
                None => {
                    store.add_tracks(stored.id(), std::slice::from_ref(&new_track)).await?;
                    new_track
                }
            };

            let mut options = AttemptOptions::for_playlist(stored.id());
            if let Some(backend) = backend {
                options = options.with_preferred_backend(backend);
            }
            if let Some(depth) = max_depth {
                options = options.with_max_depth(usize::from(depth));
            }
            let outcome = handle.download(DownloadRequest { track, options }).await?;
            Ok(print_outcome(&outcome))
        }
        Command::Verify { name, fix } => {
            let playlist = find_playlist(store, &name).await?;
            let report = integrity::audit::audit(store, core.orchestrator.integrity(), playlist.id()).await?;
            println!(
                "{}: {} valid, {} corrupted, {} missing",
                playlist.name(),
                report.valid,
                report.corrupted.len(),
                report.missing.len()
            );
            for (track, verdict) in &report.corrupted {
                println!("  corrupted: {} - {} ({verdict})", track.artist(), track.title());
            }
            if !fix || report.is_clean() {
                return Ok(exit_for(report.is_clean()));
            }
            let summary = integrity::audit::repair(&core.orchestrator, &report, cancel).await;
            println!(
                "Removed {} files, downloaded {} again, {} still failing",
                summary.removed_files, summary.redownloaded, summary.failed
            );
            Ok(exit_for(summary.failed == 0))
        }
        Command::Daemon => {
            match db.backup_into_dir(&backup_dir(db_path)).await {
                Ok(path) => info!(backup = %path.display(), "database backed up"),
                Err(error) => warn!(error = %error, "database backup failed"),
            }
            let refresher = core.proxy_source.clone().map(|source| {
                let client = core.client.clone();
                let proxies = Arc::clone(&core.proxies);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    source.refresh_periodically(&client, &proxies, &cancel).await;
                })
            });
            info!("daemon running; press Ctrl-C to stop");
            run_scheduler(
                Arc::clone(&core.engine),
                Some(Arc::new(LogNotifier)),
                cancel.clone(),
            )
            .await;
            if let Some(task) = refresher {
                cancel.cancel();
                let _ = task.await;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Playlist(_) | Command::Schedule { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn exit_for(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_report(report: &SyncReport) {
    println!(
        "{}: {} added, {} re-downloaded, {} failed, {} pending, {} removed upstream",
        report.playlist_name,
        report.added,
        report.redownloaded,
        report.failed,
        report.pending,
        report.removed
    );
    for failure in &report.failures {
        println!(
            "  {} - {}: {}",
            failure.artist,
            failure.title,
            UserFacingFailure::from(failure.kind)
        );
    }
    if report.cancelled {
        println!("  (cancelled)");
    }
}

fn print_outcome(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Success { path, backend, .. } => {
            match backend {
                Some(backend) => println!("Downloaded via {backend}: {}", path.display()),
                None => println!("Already downloaded: {}", path.display()),
            }
            ExitCode::SUCCESS
        }
        Outcome::Failure { kind, record, .. } => {
            println!("Download failed: {}", UserFacingFailure::from(*kind));
            debug!(steps = record.len(), backends = ?record.backends_tried(), "attempt record");
            ExitCode::FAILURE
        }
        Outcome::Cancelled => {
            println!("Cancelled");
            ExitCode::FAILURE
        }
    }
}
