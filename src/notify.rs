//! Structured notifications for whatever front-end is attached.
//!
//! The core never renders text for people; it hands these payloads to a
//! [`Notifier`] and the front-end decides how to present them.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::download::FailureKind;
use crate::sync::{PassSummary, SyncReport};

/// A terminal track failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFailure {
    pub playlist_id: Option<String>,
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    TrackFailed(TrackFailure),
    SyncFinished(SyncReport),
    /// A sync pass stopped before touching the stored playlist.
    SyncFailed {
        playlist_id: String,
        playlist_name: String,
        error: String,
    },
    /// A scheduled pass over every syncable playlist completed.
    ScheduledPassFinished(PassSummary),
}

/// Receiver of core notifications. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::TrackFailed(failure) => warn!(
                track_id = %failure.track_id,
                playlist = ?failure.playlist_id,
                kind = %failure.kind,
                detail = %failure.detail,
                "track failed"
            ),
            Notification::SyncFinished(report) => info!(
                playlist = %report.playlist_name,
                added = report.added,
                failed = report.failed,
                "sync finished"
            ),
            Notification::SyncFailed {
                playlist_name, error, ..
            } => warn!(playlist = %playlist_name, error = %error, "sync failed"),
            Notification::ScheduledPassFinished(summary) => info!(
                synced = summary.synced,
                total = summary.total,
                new_tracks = summary.new_tracks,
                errors = summary.errors,
                "scheduled sync pass finished"
            ),
        }
    }
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(notification);
    }
}
