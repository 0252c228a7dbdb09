//! Set difference between a stored playlist and its upstream track list.

use std::collections::HashSet;

use super::{Playlist, Track};

/// What to do with stored tracks that disappeared upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovedTrackPolicy {
    /// Keep them in the local playlist (files stay put).
    #[default]
    Keep,
    /// Drop their records so the stored list mirrors upstream exactly.
    Forget,
}

/// Result of diffing a stored playlist against upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDelta {
    /// Upstream tracks not yet stored, in upstream order, without duplicates.
    pub added: Vec<Track>,
    /// Identifiers stored locally but absent upstream.
    pub removed: Vec<String>,
    /// Number of identifiers present on both sides.
    pub unchanged: usize,
}

impl SyncDelta {
    /// Computes the delta by set difference on track identifiers.
    #[must_use]
    pub fn compute(stored: &Playlist, upstream: &[Track]) -> Self {
        let stored_ids = stored.track_ids();
        let mut seen: HashSet<&str> = HashSet::with_capacity(upstream.len());
        let mut added = Vec::new();
        let mut unchanged = 0;

        for track in upstream {
            if !seen.insert(track.id()) {
                continue;
            }
            if stored_ids.contains(track.id()) {
                unchanged += 1;
            } else {
                added.push(track.clone());
            }
        }

        let removed = stored
            .tracks()
            .iter()
            .filter(|t| !seen.contains(t.id()))
            .map(|t| t.id().to_string())
            .collect();

        Self {
            added,
            removed,
            unchanged,
        }
    }

    /// Returns true when nothing changed upstream.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Applies the delta to `playlist`.
    ///
    /// Added tracks keep whatever status they carry (callers set it after
    /// download). Removals only happen under [`RemovedTrackPolicy::Forget`].
    pub fn apply(&self, playlist: &mut Playlist, policy: RemovedTrackPolicy) {
        for track in &self.added {
            playlist.add_track(track.clone());
        }
        if policy == RemovedTrackPolicy::Forget {
            for id in &self.removed {
                playlist.remove_track(id);
            }
        }
    }
}
