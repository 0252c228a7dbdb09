//! Per-backend circuit breaker.
//!
//! A backend whose consecutive service-level failures reach the trip
//! threshold is skipped until the cooldown elapses. After that it is tried
//! again (half-open): one success closes the breaker, one more failure
//! re-trips it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Consecutive failures that trip a backend.
pub const DEFAULT_TRIP_THRESHOLD: u32 = 5;

/// How long a tripped backend is skipped.
pub const DEFAULT_TRIP_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Clone, Copy)]
struct Health {
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
}

/// Health counters for every backend the orchestrator has used.
#[derive(Debug)]
pub struct BackendHealth {
    threshold: u32,
    cooldown: Duration,
    entries: DashMap<String, Health>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new(DEFAULT_TRIP_THRESHOLD, DEFAULT_TRIP_COOLDOWN)
    }
}

impl BackendHealth {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            entries: DashMap::new(),
        }
    }

    /// True while the backend's breaker is open.
    #[must_use]
    pub fn is_tripped(&self, backend: &str) -> bool {
        self.entries
            .get(backend)
            .and_then(|h| h.tripped_at)
            .is_some_and(|at| at.elapsed() < self.cooldown)
    }

    pub fn record_success(&self, backend: &str) {
        if let Some(mut health) = self.entries.get_mut(backend)
            && health.consecutive_failures > 0
        {
            debug!(backend, "backend recovered");
            *health = Health::default();
        }
    }

    pub fn record_failure(&self, backend: &str) {
        let mut health = self.entries.entry(backend.to_string()).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if health.consecutive_failures >= self.threshold {
            if health.tripped_at.is_none_or(|at| at.elapsed() >= self.cooldown) {
                warn!(
                    backend,
                    failures = health.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "backend tripped"
                );
            }
            health.tripped_at = Some(Instant::now());
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self, backend: &str) -> u32 {
        self.entries
            .get(backend)
            .map_or(0, |h| h.consecutive_failures)
    }
}
