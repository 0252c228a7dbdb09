//! Database connection, schema, integrity check and backups.
//!
//! Opening a database runs `PRAGMA quick_check` before anything else. A
//! file that is unreadable or fails the check yields [`DbError::Corruption`];
//! the caller is expected to call [`Database::recover_from_backup`] and
//! open again rather than carry on.
//!
//! # Example
//!
//! ```no_run
//! use tracksync_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("tracksync.db")).await?;
//! db.backup_to(Path::new("tracksync.db.bak")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// File name prefix for timestamped backups.
const BACKUP_PREFIX: &str = "tracksync-";

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The file is not a readable database or failed `quick_check`.
    #[error("database at {path} is corrupt: {detail}\n  Suggestion: restore the most recent backup")]
    Corruption {
        /// Database file.
        path: PathBuf,
        /// What the check reported.
        detail: String,
    },

    /// Backup or restore file handling failed.
    #[error("backup IO error at {path}: {source}")]
    Backup {
        /// File involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Recovery was requested but there is nothing to restore.
    #[error("no backup found in {dir}")]
    NoBackup {
        /// Directory searched.
        dir: PathBuf,
    },
}

impl DbError {
    fn backup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Backup {
            path: path.into(),
            source,
        }
    }

    /// Returns true for [`DbError::Corruption`].
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Returns true when SQLite reports a damaged or foreign file.
#[must_use]
pub fn is_corruption_error(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = error else {
        return false;
    };
    if matches!(
        db_error.code().as_deref(),
        Some("11" | "26" | "SQLITE_CORRUPT" | "SQLITE_NOTADB")
    ) {
        return true;
    }
    let message = db_error.message().to_ascii_lowercase();
    message.contains("malformed") || message.contains("not a database")
}

/// Database connection wrapper with connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path`, checks it,
    /// enables WAL and runs migrations.
    ///
    /// # Errors
    ///
    /// - [`DbError::Corruption`] if the file is damaged
    /// - [`DbError::Connection`] or [`DbError::Migration`] otherwise
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await
            .map_err(|e| corruption_or(db_path, e))?;

        let db = Self { pool };
        db.quick_check(db_path).await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&db.pool)
            .await
            .map_err(|e| corruption_or(db_path, e))?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&db.pool)
            .await?;

        sqlx::migrate!("./migrations").run(&db.pool).await?;

        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn quick_check(&self, db_path: &Path) -> Result<(), DbError> {
        let rows: Vec<(String,)> = sqlx::query_as("PRAGMA quick_check")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| corruption_or(db_path, e))?;
        match rows.first() {
            Some((answer,)) if answer == "ok" => Ok(()),
            Some((answer,)) => Err(DbError::Corruption {
                path: db_path.to_path_buf(),
                detail: answer.clone(),
            }),
            None => Err(DbError::Corruption {
                path: db_path.to_path_buf(),
                detail: "quick_check returned nothing".to_string(),
            }),
        }
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Writes a consistent snapshot to `dest`.
    ///
    /// The snapshot goes to a temporary sibling first and is renamed into
    /// place, so `dest` is never half-written.
    ///
    /// # Errors
    ///
    /// [`DbError::Connection`] if `VACUUM INTO` fails, [`DbError::Backup`]
    /// for file handling.
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn backup_to(&self, dest: &Path) -> Result<(), DbError> {
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DbError::backup(parent, e))?;
        }
        let temp = with_suffix(dest, ".tmp");
        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            tokio::fs::remove_file(&temp)
                .await
                .map_err(|e| DbError::backup(&temp, e))?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(temp.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        tokio::fs::rename(&temp, dest)
            .await
            .map_err(|e| DbError::backup(dest, e))?;
        info!("database backup written");
        Ok(())
    }

    /// Writes a timestamped backup into `dir` and returns its path.
    ///
    /// # Errors
    ///
    /// Same as [`Database::backup_to`].
    pub async fn backup_into_dir(&self, dir: &Path) -> Result<PathBuf, DbError> {
        let name = format!("{BACKUP_PREFIX}{}.db", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let dest = dir.join(name);
        self.backup_to(&dest).await?;
        Ok(dest)
    }

    /// Newest backup in `dir`, by name (names embed a sortable timestamp).
    ///
    /// # Errors
    ///
    /// [`DbError::Backup`] if the directory cannot be read.
    pub async fn latest_backup(dir: &Path) -> Result<Option<PathBuf>, DbError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DbError::backup(dir, e)),
        };
        let mut newest: Option<PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DbError::backup(dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with(BACKUP_PREFIX) && name.ends_with(".db")) {
                continue;
            }
            let path = entry.path();
            if newest.as_ref().is_none_or(|current| path > *current) {
                newest = Some(path);
            }
        }
        Ok(newest)
    }

    /// Replaces the (corrupt) database at `db_path` with the newest backup in
    /// `backup_dir`. The damaged file is kept next to it with a
    /// `.corrupt-<timestamp>` suffix. Returns the backup that was restored.
    ///
    /// # Errors
    ///
    /// [`DbError::NoBackup`] when the directory holds no backup,
    /// [`DbError::Backup`] for file handling.
    #[instrument(fields(db = %db_path.display(), dir = %backup_dir.display()))]
    pub async fn recover_from_backup(db_path: &Path, backup_dir: &Path) -> Result<PathBuf, DbError> {
        let Some(backup) = Self::latest_backup(backup_dir).await? else {
            return Err(DbError::NoBackup {
                dir: backup_dir.to_path_buf(),
            });
        };

        if tokio::fs::try_exists(db_path).await.unwrap_or(false) {
            let aside = with_suffix(
                db_path,
                &format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")),
            );
            tokio::fs::rename(db_path, &aside)
                .await
                .map_err(|e| DbError::backup(db_path, e))?;
            warn!(aside = %aside.display(), "moved corrupt database aside");
        }
        for suffix in ["-wal", "-shm"] {
            let side = with_suffix(db_path, suffix);
            if tokio::fs::try_exists(&side).await.unwrap_or(false) {
                tokio::fs::remove_file(&side)
                    .await
                    .map_err(|e| DbError::backup(&side, e))?;
            }
        }

        let temp = with_suffix(db_path, ".restore");
        tokio::fs::copy(&backup, &temp)
            .await
            .map_err(|e| DbError::backup(&backup, e))?;
        tokio::fs::rename(&temp, db_path)
            .await
            .map_err(|e| DbError::backup(db_path, e))?;
        info!(backup = %backup.display(), "database restored from backup");
        Ok(backup)
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn corruption_or(path: &Path, error: sqlx::Error) -> DbError {
    if is_corruption_error(&error) {
        DbError::Corruption {
            path: path.to_path_buf(),
            detail: error.to_string(),
        }
    } else {
        DbError::Connection(error)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_database_migrations_create_tables() {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO playlists (id, name, folder) VALUES ('p', 'P', '/m')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tracks (playlist_id, track_id, position, title, artist, target_path) \
             VALUES ('p', 't', 0, 'T', 'A', '/m/A - T.mp3')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO download_log (track_id, outcome) VALUES ('t', 'success')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO settings (key, value) VALUES ('k', 'v')")
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_track_status_check_constraint() {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO playlists (id, name, folder) VALUES ('p', 'P', '/m')")
            .execute(db.pool())
            .await
            .unwrap();
        let result = sqlx::query(
            "INSERT INTO tracks (playlist_id, track_id, position, title, artist, target_path, status) \
             VALUES ('p', 't', 0, 'T', 'A', '/x', 'bogus')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err(), "invalid status should be rejected");
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_garbage_file_is_corruption() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.db");
        std::fs::write(&path, vec![0x5Au8; 8192]).unwrap();
        let err = Database::new(&path).await.unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_backup_then_recover_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("live.db");
        let backups = temp_dir.path().join("backups");

        let db = Database::new(&db_path).await.unwrap();
        sqlx::query("INSERT INTO settings (key, value) VALUES ('marker', 'before')")
            .execute(db.pool())
            .await
            .unwrap();
        let backup = db.backup_into_dir(&backups).await.unwrap();
        assert!(backup.exists());
        assert!(!with_suffix(&backup, ".tmp").exists());
        db.close().await;

        // trash the live file
        std::fs::write(&db_path, vec![0u8; 4096]).unwrap();
        assert!(Database::new(&db_path).await.unwrap_err().is_corruption());

        let restored = Database::recover_from_backup(&db_path, &backups).await.unwrap();
        assert_eq!(restored, backup);

        let db = Database::new(&db_path).await.unwrap();
        let (value,): (String,) = sqlx::query_as("SELECT value FROM settings WHERE key = 'marker'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(value, "before");
    }

    #[tokio::test]
    async fn test_recover_without_backup() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = Database::recover_from_backup(
            &temp_dir.path().join("x.db"),
            &temp_dir.path().join("none"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::NoBackup { .. }));
    }
}
