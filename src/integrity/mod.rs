//! Post-download verification of audio files.
//!
//! # Checks, cheapest first
//!
//! 1. the file exists
//! 2. it is not empty and clears the byte floors (absolute, and
//!    size-for-duration when the expected duration is known)
//! 3. probed duration matches the expected one within tolerance
//!    (skipped when no probe is configured or it cannot answer)
//! 4. the head looks like an audio container
//!
//! [`audit`] applies the checker to a whole playlist and repairs it.

pub mod audit;
mod header;
mod probe;

pub use audit::{AuditReport, RepairSummary};
pub use header::{AudioFormat, detect as detect_format, sniff};
pub use probe::{
    DEFAULT_PROBE_CONCURRENCY, DurationProbe, FfprobeProbe, FixedProbe, PROBE_TIMEOUT,
    parse_duration_output,
};

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

/// Absolute minimum for a complete song file.
pub const DEFAULT_MIN_BYTES: u64 = 100 * 1024;

/// Default duration tolerance in seconds.
pub const DEFAULT_TOLERANCE_SECS: f64 = 5.0;

/// Default duration tolerance as a fraction of the expected duration.
pub const DEFAULT_TOLERANCE_PCT: f64 = 0.03;

/// Lowest plausible bitrate used for the size-for-duration floor.
pub const DEFAULT_MIN_BITRATE_KBPS: u32 = 32;

/// Verification thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityPolicy {
    /// Files below this many bytes are `TooSmall`.
    pub min_bytes: u64,
    /// Allowed absolute duration drift.
    pub tolerance_secs: f64,
    /// Allowed drift as a fraction of the expected duration.
    pub tolerance_pct: f64,
    /// Bitrate for the size-for-duration floor (half of
    /// `expected * kbps * 1024 / 8`).
    pub min_bitrate_kbps: u32,
    /// Whether the magic-byte check runs.
    pub check_header: bool,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_BYTES,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
            min_bitrate_kbps: DEFAULT_MIN_BITRATE_KBPS,
            check_header: true,
        }
    }
}

impl IntegrityPolicy {
    /// Allowed drift for a track of `expected_secs`.
    #[must_use]
    pub fn tolerance_for(&self, expected_secs: u32) -> f64 {
        self.tolerance_secs
            .max(self.tolerance_pct * f64::from(expected_secs))
    }

    /// Smallest believable size for `expected_secs` of audio.
    #[must_use]
    pub fn size_floor_for(&self, expected_secs: u32) -> u64 {
        u64::from(expected_secs) * u64::from(self.min_bitrate_kbps) * 1024 / 8 / 2
    }
}

/// Outcome of [`IntegrityChecker::verify`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Ok,
    /// No file at the path.
    Missing,
    /// Zero bytes.
    Empty,
    TooSmall {
        bytes: u64,
        floor: u64,
    },
    DurationMismatch {
        expected_secs: u32,
        probed_secs: f64,
        /// `probed - expected`, signed.
        delta: f64,
    },
    /// The head is not a recognized audio container.
    HeaderInvalid,
}

impl VerificationResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Missing => "missing",
            Self::Empty => "empty",
            Self::TooSmall { .. } => "too_small",
            Self::DurationMismatch { .. } => "duration_mismatch",
            Self::HeaderInvalid => "header_invalid",
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { bytes, floor } => write!(f, "too small ({bytes} < {floor} bytes)"),
            Self::DurationMismatch {
                expected_secs,
                probed_secs,
                delta,
            } => write!(
                f,
                "duration mismatch (expected {expected_secs}s, probed {probed_secs:.1}s, delta {delta:+.1}s)"
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Runs the verification pipeline.
#[derive(Clone)]
pub struct IntegrityChecker {
    policy: IntegrityPolicy,
    probe: Option<Arc<dyn DurationProbe>>,
}

impl fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("policy", &self.policy)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new(IntegrityPolicy::default())
    }
}

impl IntegrityChecker {
    /// Checker without a duration probe.
    #[must_use]
    pub fn new(policy: IntegrityPolicy) -> Self {
        Self {
            policy,
            probe: None,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DurationProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &IntegrityPolicy {
        &self.policy
    }

    /// Verifies `path`, optionally against an expected duration.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn verify(&self, path: &Path, expected_secs: Option<u32>) -> VerificationResult {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return VerificationResult::Missing;
        };
        if !metadata.is_file() {
            return VerificationResult::Missing;
        }

        let bytes = metadata.len();
        if bytes == 0 {
            return VerificationResult::Empty;
        }
        let floor = expected_secs
            .map_or(0, |secs| self.policy.size_floor_for(secs))
            .max(self.policy.min_bytes);
        if bytes < floor {
            return VerificationResult::TooSmall { bytes, floor };
        }

        if let (Some(probe), Some(expected)) = (&self.probe, expected_secs)
            && let Some(probed) = probe.duration_secs(path).await
        {
            let delta = probed - f64::from(expected);
            let tolerance = self.policy.tolerance_for(expected);
            debug!(expected, probed, tolerance, "duration probed");
            if delta.abs() > tolerance {
                return VerificationResult::DurationMismatch {
                    expected_secs: expected,
                    probed_secs: probed,
                    delta,
                };
            }
        }

        if self.policy.check_header {
            match header::detect(path).await {
                Ok(Some(_)) => {}
                Ok(None) => return VerificationResult::HeaderInvalid,
                Err(e) => {
                    debug!(error = %e, "header read failed");
                    return VerificationResult::Missing;
                }
            }
        }
        VerificationResult::Ok
    }
}
