//! Retry logic with exponential backoff around any fallible async operation.
//!
//! Every failure is classified into a [`FailureType`]. The [`RetryPolicy`]
//! decides whether a failed attempt is retried and after what delay, and
//! [`RetryPolicy::run`] drives the loop with cooperative cancellation.
//!
//! # Example
//!
//! ```
//! use tracksync_core::download::{DownloadError, FailureType, RetryDecision, RetryPolicy, Retryable};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/a.mp3", 503);
//!
//! match policy.should_retry(error.failure_type(), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::DownloadError;
use super::rate_limiter::parse_retry_after;

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Rate-limit signals wait this many times longer than plain transient errors.
const DEFAULT_RATE_LIMIT_FACTOR: f64 = 2.0;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    /// Timeout, connection reset, HTTP 5xx. Retried with backoff.
    Transient,

    /// HTTP 429 or an equivalent service signal. Retried with a longer
    /// backoff; the caller rotates its proxy between attempts.
    RateLimited,

    /// A session token was rejected. Retried once immediately so the adapter
    /// can re-authenticate, then once more as a transient failure.
    AuthExpired,

    /// Malformed input, 4xx other than rate limiting, unsupported track.
    /// Never retried.
    Permanent,
}

impl FailureType {
    /// Returns a short label for logs and the download log table.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::AuthExpired => "auth_expired",
            Self::Permanent => "permanent",
        }
    }

    /// Returns true for every class the retry loop absorbs.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that knows how the retry loop should treat it.
pub trait Retryable {
    /// Classifies this error.
    fn failure_type(&self) -> FailureType;

    /// Server-mandated minimum wait (e.g. from a `Retry-After` header).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number comes next (1-indexed).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason, for logs only.
        reason: String,
    },
}

/// Terminal result of [`RetryPolicy::run`] when the operation never succeeded.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Retryable failures used up the attempt budget.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last failure observed.
        last: E,
    },
    /// A non-retryable failure ended the loop early.
    NotRetryable {
        /// Attempts made, including the failing one.
        attempts: u32,
        /// The failure.
        error: E,
    },
    /// The caller cancelled before or between attempts.
    Cancelled {
        /// Attempts that completed before cancellation.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Returns the underlying failure, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::NotRetryable { error, .. } => Some(error),
            Self::Cancelled { .. } => None,
        }
    }

    /// Returns true when the loop stopped because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::NotRetryable { error, .. } => write!(f, "{error}"),
            Self::Cancelled { .. } => f.write_str("cancelled"),
        }
    }
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(max_delay, base_delay * 2^(attempt-1)) * random(0.5, 1.5)
/// ```
///
/// Rate-limited failures multiply that by `rate_limit_factor`. A
/// server-provided `Retry-After` raises the delay to at least that value.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    rate_limit_factor: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            rate_limit_factor: DEFAULT_RATE_LIMIT_FACTOR,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom attempt budget and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Sets the extra multiplier for rate-limited failures (at least 1.0).
    #[must_use]
    pub fn with_rate_limit_factor(mut self, factor: f64) -> Self {
        self.rate_limit_factor = factor.max(1.0);
        self
    }

    /// Disables jitter so delays are exact. Intended for tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = match failure_type {
            FailureType::AuthExpired => Duration::ZERO,
            FailureType::RateLimited => self
                .calculate_delay(attempt)
                .mul_f64(self.rate_limit_factor),
            _ => self.calculate_delay(attempt),
        };

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            failure = %failure_type,
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// The closure receives the 1-indexed attempt number. An `AuthExpired`
    /// failure is retried immediately the first time, treated as transient
    /// the second time, and as permanent after that.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut auth_refreshes = 0u32;
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let error = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt - 1 });
                }
                result = operation(attempt) => match result {
                    Ok(value) => return Ok(value),
                    Err(error) => error,
                },
            };

            let mut failure_type = error.failure_type();
            if failure_type == FailureType::AuthExpired {
                auth_refreshes += 1;
                failure_type = match auth_refreshes {
                    1 => FailureType::AuthExpired,
                    2 => FailureType::Transient,
                    _ => FailureType::Permanent,
                };
            }

            match self.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = match error.retry_after() {
                        Some(hint) if hint > delay => hint,
                        _ => delay,
                    };
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying after failure"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "not retrying");
                    return Err(if failure_type.is_retryable() {
                        RetryError::Exhausted {
                            attempts: attempt,
                            last: error,
                        }
                    } else {
                        RetryError::NotRetryable {
                            attempts: attempt,
                            error,
                        }
                    });
                }
            }
        }
    }

    /// Exponential delay for the given 1-indexed attempt, capped, with jitter.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

impl Retryable for DownloadError {
    /// HTTP status classification:
    ///
    /// | Status | Type |
    /// |--------|------|
    /// | 401 | AuthExpired |
    /// | 403, 407 | Permanent |
    /// | 408 | Transient |
    /// | 429 | RateLimited |
    /// | other 4xx | Permanent |
    /// | 5xx | Transient |
    ///
    /// Timeouts, undecodable replies and most network errors are transient; TLS failures, IO
    /// errors, bad URLs and non-audio bodies are permanent.
    fn failure_type(&self) -> FailureType {
        match self {
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Timeout { .. } | Self::Decode { .. } => FailureType::Transient,
            Self::Network { source, .. } => {
                if is_tls_error(source) {
                    FailureType::Permanent
                } else {
                    FailureType::Transient
                }
            }
            Self::Io { .. }
            | Self::InvalidUrl { .. }
            | Self::UnexpectedContent { .. }
            | Self::Proxy { .. }
            | Self::ClientBuild { .. } => FailureType::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after_header().and_then(parse_retry_after)
    }
}

/// Classifies an HTTP status code.
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 => FailureType::AuthExpired,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        400..=499 => FailureType::Permanent,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
