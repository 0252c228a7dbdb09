//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Download playlist tracks through a chain of backends and keep playlist
/// folders in sync with their upstream sources.
#[derive(Parser, Debug)]
#[command(name = "tracksync")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/tracksync/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file (default: $XDG_DATA_HOME/tracksync/tracksync.db)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage playlists
    #[command(subcommand)]
    Playlist(PlaylistCommand),

    /// Sync one playlist, or every syncable playlist
    Sync {
        /// Playlist name (all syncable playlists when omitted)
        name: Option<String>,
    },

    /// Download a single track into a playlist
    Download {
        /// Track URL or identifier (Spotify, YouTube)
        track: String,

        /// Playlist the track belongs to
        #[arg(long, short = 'p')]
        playlist: String,

        #[arg(long, default_value = "Unknown")]
        title: String,

        #[arg(long, default_value = "Unknown")]
        artist: String,

        /// Expected length, e.g. 3:30
        #[arg(long)]
        duration: Option<String>,

        /// Try this backend first
        #[arg(long)]
        backend: Option<String>,

        /// Give up after this many backends (1-5)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
        max_depth: Option<u8>,
    },

    /// Check every downloaded file of a playlist
    Verify {
        name: String,

        /// Delete bad files and download them again
        #[arg(long)]
        fix: bool,
    },

    /// Show or change the weekly sync schedule
    Schedule {
        /// Day of week (monday..sunday)
        #[arg(long)]
        day: Option<String>,

        /// Time of day, HH:MM
        #[arg(long)]
        time: Option<String>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Run the weekly scheduler until interrupted
    Daemon,
}

#[derive(Subcommand, Debug)]
pub enum PlaylistCommand {
    /// Add a playlist
    Add {
        name: String,

        /// Upstream playlist URL (required unless --custom)
        #[arg(required_unless_present = "custom")]
        url: Option<String>,

        /// Local-only playlist, never synced
        #[arg(long)]
        custom: bool,

        /// Folder for the playlist's files (default: <music_dir>/<name>)
        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// List playlists
    List,

    /// Delete a playlist
    Delete {
        name: String,

        /// Also delete downloaded files
        #[arg(long)]
        delete_files: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["tracksync", "-vv", "daemon"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Command::Daemon));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["tracksync", "sync", "--db", "/tmp/x.db", "-q"]).unwrap();
        assert!(args.quiet);
        assert_eq!(args.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(args.command, Command::Sync { name: None }));
    }

    #[test]
    fn test_cli_playlist_add_requires_url_unless_custom() {
        let result = Args::try_parse_from(["tracksync", "playlist", "add", "Mix"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );

        let args = Args::try_parse_from(["tracksync", "playlist", "add", "Mine", "--custom"]).unwrap();
        match args.command {
            Command::Playlist(PlaylistCommand::Add { custom, url, .. }) => {
                assert!(custom);
                assert!(url.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_options() {
        let args = Args::try_parse_from([
            "tracksync",
            "download",
            "spotify:track:abc",
            "--playlist",
            "Mix",
            "--backend",
            "yt-dlp",
            "--max-depth",
            "2",
        ])
        .unwrap();
        match args.command {
            Command::Download {
                track,
                playlist,
                backend,
                max_depth,
                title,
                ..
            } => {
                assert_eq!(track, "spotify:track:abc");
                assert_eq!(playlist, "Mix");
                assert_eq!(backend.as_deref(), Some("yt-dlp"));
                assert_eq!(max_depth, Some(2));
                assert_eq!(title, "Unknown");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_max_depth_range() {
        let result = Args::try_parse_from([
            "tracksync", "download", "x", "-p", "Mix", "--max-depth", "9",
        ]);
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_schedule_enable_conflicts_with_disable() {
        let result = Args::try_parse_from(["tracksync", "schedule", "--enable", "--disable"]);
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Args::try_parse_from(["tracksync"]).is_err());
    }
}
