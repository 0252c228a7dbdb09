//! Per-backend token-bucket rate limiting.
//!
//! Each backend gets its own bucket, so a slow or throttled service never
//! holds up calls to the others. Server-mandated pauses (`Retry-After`) are
//! recorded against the bucket and honored by the next [`RateLimiter::acquire`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tracksync_core::download::RateLimiter;
//!
//! # async fn example() {
//! // Burst of 2, then one call every 500ms per backend
//! let limiter = RateLimiter::new(2, Duration::from_millis(500));
//! limiter.acquire("ezconv").await;
//! limiter.acquire("ezconv").await;
//! limiter.acquire("pullmp3").await; // independent bucket
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per backend.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value honored (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Token-bucket limiter keyed by backend name.
///
/// Meant to be shared behind `Arc`. Bucket state lives in a `DashMap` of
/// `Arc`-wrapped entries; the map shard lock is released before awaiting the
/// per-bucket mutex.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    disabled: bool,
    buckets: DashMap<String, Arc<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `capacity` back-to-back calls per backend,
    /// refilled at one token per `refill_interval`.
    #[must_use]
    #[instrument(skip_all, fields(capacity = capacity, refill_ms = refill_interval.as_millis()))]
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            capacity: capacity.max(1),
            refill_interval,
            disabled: refill_interval.is_zero(),
            buckets: DashMap::new(),
        }
    }

    /// Creates a limiter that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            capacity: 1,
            refill_interval: Duration::ZERO,
            disabled: true,
            buckets: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn bucket(&self, backend: &str) -> Arc<Bucket> {
        self.buckets
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(self.capacity)))
            .clone()
    }

    /// Waits until `backend` has a token available, then consumes it.
    #[instrument(skip(self))]
    pub async fn acquire(&self, backend: &str) {
        if self.disabled {
            return;
        }

        let bucket = self.bucket(backend);
        let mut state = bucket.state.lock().await;

        let mut waited = Duration::ZERO;
        if let Some(until) = state.blocked_until.take() {
            let now = Instant::now();
            if until > now {
                let pause = until - now;
                debug!(backend, delay_ms = pause.as_millis(), "honoring server rate limit");
                tokio::time::sleep(pause).await;
                waited += pause;
            }
        }

        refill(&mut state, self.capacity, self.refill_interval);
        if state.tokens < 1.0 {
            let missing = 1.0 - state.tokens;
            let delay = self.refill_interval.mul_f64(missing);
            debug!(backend, delay_ms = delay.as_millis(), "bucket empty, waiting");
            tokio::time::sleep(delay).await;
            waited += delay;
            refill(&mut state, self.capacity, self.refill_interval);
        }
        state.tokens = (state.tokens - 1.0).max(0.0);

        if !waited.is_zero() {
            let cumulative = bucket.add_cumulative_delay(waited);
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    backend,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider lowering request volume"
                );
            }
        }
    }

    /// Records a server-mandated pause (from `Retry-After`) for `backend`.
    #[instrument(skip(self))]
    pub async fn record_rate_limit(&self, backend: &str, delay: Duration) {
        let delay = delay.min(MAX_RETRY_AFTER);
        let bucket = self.bucket(backend);
        let mut state = bucket.state.lock().await;
        let until = Instant::now() + delay;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(backend, delay_ms = delay.as_millis(), "recorded server rate limit");
    }

    /// Total time `backend` callers have spent waiting.
    #[must_use]
    pub fn cumulative_delay(&self, backend: &str) -> Duration {
        self.buckets
            .get(backend)
            .map_or(Duration::ZERO, |b| {
                Duration::from_millis(b.cumulative_delay_ms.load(Ordering::SeqCst))
            })
    }
}

fn refill(state: &mut BucketState, capacity: u32, interval: Duration) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill);
    if !interval.is_zero() {
        let gained = elapsed.as_secs_f64() / interval.as_secs_f64();
        state.tokens = (state.tokens + gained).min(f64::from(capacity));
    }
    state.last_refill = now;
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 forms (integer seconds and HTTP-date). Returns
/// `None` if unparseable; caps values at one hour.
///
/// ```
/// use std::time::Duration;
/// use tracksync_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds maximum, capping at 1 hour");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        match datetime.duration_since(std::time::SystemTime::now()) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            Err(_) => {
                debug!(header_value, "Retry-After date is in the past");
                Some(Duration::ZERO)
            }
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
