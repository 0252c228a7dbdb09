//! Weekly sync schedule and the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, NaiveTime, Utc, Weekday};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::SyncEngine;
use crate::notify::{Notification, Notifier};
use crate::store::{PlaylistStore, StoreError};

/// Settings keys under which the schedule is stored.
pub const KEY_ENABLED: &str = "sync_enabled";
pub const KEY_DAY: &str = "sync_day";
pub const KEY_TIME: &str = "sync_time";
pub const KEY_NOTIFY: &str = "sync_notify";
pub const KEY_LAST_SYNC: &str = "last_sync";

/// How often a disabled schedule is re-read.
const DISABLED_POLL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid sync day '{0}': expected monday..sunday")]
    InvalidDay(String),

    #[error("invalid sync time '{0}': expected HH:MM")]
    InvalidTime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Weekly slot for the scheduled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSchedule {
    pub enabled: bool,
    pub weekday: Weekday,
    pub time: NaiveTime,
    /// Whether scheduled pass results are announced.
    pub notify: bool,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            weekday: Weekday::Mon,
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            notify: true,
        }
    }
}

/// Parses `monday`..`sunday` (any case, three-letter forms too).
///
/// # Errors
///
/// [`ScheduleError::InvalidDay`] for anything else.
pub fn parse_weekday(value: &str) -> Result<Weekday, ScheduleError> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| ScheduleError::InvalidDay(value.to_string()))
}

/// Parses `HH:MM`.
///
/// # Errors
///
/// [`ScheduleError::InvalidTime`] for anything else.
pub fn parse_time(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(value.to_string()))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

impl SyncSchedule {
    /// The next slot strictly after `now`, or `None` when disabled.
    ///
    /// A slot falling on today's weekday but at or before `now` moves to the
    /// following week.
    #[must_use]
    pub fn next_run_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.enabled {
            return None;
        }
        let today = now.date();
        let days_ahead = (i64::from(self.weekday.num_days_from_monday())
            - i64::from(today.weekday().num_days_from_monday()))
        .rem_euclid(7);
        let mut candidate = (today + chrono::Duration::days(days_ahead)).and_time(self.time);
        if candidate <= now {
            candidate += chrono::Duration::days(7);
        }
        Some(candidate)
    }

    /// Reads the schedule from the settings table; absent keys keep defaults.
    ///
    /// # Errors
    ///
    /// Store failures, or a stored day/time that no longer parses.
    pub async fn load(store: &dyn PlaylistStore) -> Result<Self, ScheduleError> {
        let mut schedule = Self::default();
        if let Some(value) = store.get_setting(KEY_ENABLED).await? {
            schedule.enabled = value == "true";
        }
        if let Some(value) = store.get_setting(KEY_DAY).await? {
            schedule.weekday = parse_weekday(&value)?;
        }
        if let Some(value) = store.get_setting(KEY_TIME).await? {
            schedule.time = parse_time(&value)?;
        }
        if let Some(value) = store.get_setting(KEY_NOTIFY).await? {
            schedule.notify = value == "true";
        }
        Ok(schedule)
    }

    /// Writes every field to the settings table.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn save(&self, store: &dyn PlaylistStore) -> Result<(), ScheduleError> {
        store
            .set_setting(KEY_ENABLED, if self.enabled { "true" } else { "false" })
            .await?;
        store.set_setting(KEY_DAY, weekday_name(self.weekday)).await?;
        store
            .set_setting(KEY_TIME, &self.time.format("%H:%M").to_string())
            .await?;
        store
            .set_setting(KEY_NOTIFY, if self.notify { "true" } else { "false" })
            .await?;
        Ok(())
    }
}

/// When the last scheduled or full pass finished.
///
/// # Errors
///
/// Store failures.
pub async fn last_sync(store: &dyn PlaylistStore) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(store
        .get_setting(KEY_LAST_SYNC)
        .await?
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|at| at.with_timezone(&Utc)))
}

/// Sleeps until each scheduled slot and runs a pass over every syncable
/// playlist. The schedule is re-read every round so changes apply without a
/// restart. Returns when `cancel` fires.
#[instrument(skip_all)]
pub async fn run_scheduler(
    engine: Arc<SyncEngine>,
    notifier: Option<Arc<dyn Notifier>>,
    cancel: CancellationToken,
) {
    loop {
        let schedule = match SyncSchedule::load(engine.store().as_ref()).await {
            Ok(schedule) => schedule,
            Err(error) => {
                warn!(error = %error, "could not read sync schedule; using defaults");
                SyncSchedule::default()
            }
        };

        let now = Local::now().naive_local();
        let wait = match schedule.next_run_after(now) {
            Some(next) => {
                info!(next = %next, "next scheduled sync");
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
            None => {
                debug!("scheduled sync disabled");
                DISABLED_POLL
            }
        };

        tokio::select! {
            () = cancel.cancelled() => {
                info!("scheduler stopped");
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }
        if !schedule.enabled {
            continue;
        }

        info!("starting scheduled sync");
        match engine.sync_all(&cancel).await {
            Ok(outcome) => {
                if schedule.notify
                    && let Some(notifier) = &notifier
                {
                    notifier.notify(Notification::ScheduledPassFinished(outcome.summary));
                }
            }
            Err(error) => warn!(error = %error, "scheduled sync failed"),
        }
    }
}
