//! Error types for playlist persistence.

use std::fmt;

use thiserror::Error;

use crate::db::is_corruption_error;

/// Structured classification for database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl StoreDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(
                    code.as_deref(),
                    Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
                ) {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_foreign_key_violation()
                    || database_error.is_check_violation()
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors from [`super::PlaylistStore`] operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: StoreDbErrorKind,
        /// Database error text.
        message: String,
    },

    /// The store is damaged. No further writes until it is restored from backup.
    #[error("store is corrupt: {detail}\n  Suggestion: restore the most recent backup")]
    Corruption {
        /// What SQLite reported.
        detail: String,
    },

    /// No playlist with this id.
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),

    /// No such track in the playlist.
    #[error("track {track_id} not found in playlist {playlist_id}")]
    TrackNotFound {
        /// Playlist id.
        playlist_id: String,
        /// Track id.
        track_id: String,
    },

    /// A stored value could not be decoded.
    #[error("invalid stored value in {column}: {value}")]
    InvalidRow {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_corruption_error(&err) {
            return Self::Corruption {
                detail: err.to_string(),
            };
        }
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    pub fn invalid_row(column: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidRow {
            column,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
