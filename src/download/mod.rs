//! Download machinery: HTTP plumbing, retry/backoff, rate limiting and the
//! orchestrator that drives the backend chain.
//!
//! # Layers
//!
//! - [`HttpClient`] - proxy-aware JSON calls and streaming downloads
//! - [`RetryPolicy`] - exponential backoff around any [`Retryable`] operation
//! - [`RateLimiter`] - per-backend token buckets
//! - [`BackendHealth`] - per-backend circuit breaker
//! - [`Orchestrator`] - one track through the chain, exactly once
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tracksync_core::download::{AttemptOptions, Orchestrator, Outcome};
//! use tracksync_core::playlist::Track;
//!
//! # async fn example(orchestrator: Arc<Orchestrator>) {
//! let track = Track::in_folder("spotify:track:abc", "Song", "Artist", Path::new("/music/Mix"));
//! match orchestrator
//!     .attempt(&track, &AttemptOptions::default(), &CancellationToken::new())
//!     .await
//! {
//!     Outcome::Success { path, .. } => println!("saved {}", path.display()),
//!     Outcome::Failure { kind, detail, .. } => println!("failed ({kind}): {detail}"),
//!     Outcome::Cancelled => println!("cancelled"),
//! }
//! # }
//! ```

mod attempt;
mod client;
mod error;
mod health;
mod orchestrator;
pub mod rate_limiter;
mod retry;

pub use attempt::{AttemptRecord, AttemptStep, FailureKind, Outcome, StepOutcome};
pub use client::{BROWSER_USER_AGENT, HttpClient};
pub use error::DownloadError;
pub use health::{BackendHealth, DEFAULT_TRIP_COOLDOWN, DEFAULT_TRIP_THRESHOLD};
pub use orchestrator::{
    AttemptOptions, DEFAULT_CONCURRENCY, Orchestrator, OrchestratorConfig, OrchestratorError,
    staging_path,
};
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryError, RetryPolicy, Retryable,
    classify_http_status,
};

// Note: no module-local Result aliases. Use `Result<T, DownloadError>`
// explicitly in function signatures.
