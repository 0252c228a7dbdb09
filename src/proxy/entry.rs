//! A single egress proxy with its health counters.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::ProxyError;

/// Proxy wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" | "socks5h" => Ok(Self::Socks5),
            other => Err(format!("unsupported proxy protocol: {other}")),
        }
    }
}

/// Where a proxy lives. Parsed from `host:port` (HTTP assumed) or
/// `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    protocol: ProxyProtocol,
    host: String,
    port: u16,
}

impl ProxyAddress {
    #[must_use]
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    /// Parses one line of a proxy list.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidAddress`] for anything that is not
    /// `host:port` or `scheme://host:port`.
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let trimmed = input.trim();
        let invalid = || ProxyError::invalid_address(trimmed);

        let (protocol, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme.parse().map_err(|_| invalid())?, rest),
            None => (ProxyProtocol::Http, trimmed),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.contains(['/', ' ', '@']) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(protocol, host, port))
    }

    #[must_use]
    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL as understood by reqwest and yt-dlp.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// Health state of one proxy.
///
/// Mutated only through [`ProxyEntry::record_success`] and
/// [`ProxyEntry::record_failure`], always under the per-entry lock held by
/// the manager.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    address: ProxyAddress,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    blacklist_strikes: u32,
    last_used: Option<Instant>,
    last_success: Option<Instant>,
    latency_ms: Option<f64>,
    blacklisted_until: Option<Instant>,
}

/// Thresholds applied when recording a failure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlacklistRule {
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub growth_factor: f64,
    pub max_cooldown: Duration,
}

impl BlacklistRule {
    /// Cooldown for the given strike number (0 for the first blacklisting).
    #[allow(clippy::cast_possible_wrap)]
    pub fn cooldown(&self, strikes: u32) -> Duration {
        let factor = self.growth_factor.max(1.0).powi(strikes.min(32) as i32);
        let secs = (self.base_cooldown.as_secs_f64() * factor).min(self.max_cooldown.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Half-life for the recency weight in [`ProxyEntry::score`].
const RECENCY_HALF_LIFE: Duration = Duration::from_secs(600);

impl ProxyEntry {
    #[must_use]
    pub fn new(address: ProxyAddress) -> Self {
        Self {
            address,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            blacklist_strikes: 0,
            last_used: None,
            last_success: None,
            latency_ms: None,
            blacklisted_until: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    #[must_use]
    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    #[must_use]
    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    #[must_use]
    pub fn blacklisted_until(&self) -> Option<Instant> {
        self.blacklisted_until
    }

    /// Smoothed latency of successful calls, in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    #[must_use]
    pub fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }

    /// Success rate (Laplace-smoothed) weighted by how recently the proxy
    /// last worked. Never zero, so untested proxies stay selectable.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, now: Instant) -> f64 {
        let rate = (self.success_count as f64 + 1.0)
            / (self.success_count as f64 + self.failure_count as f64 + 2.0);
        let recency = match self.last_success {
            Some(at) => {
                let age = now.saturating_duration_since(at).as_secs_f64();
                0.5 + 0.5 * 0.5f64.powf(age / RECENCY_HALF_LIFE.as_secs_f64())
            }
            None => 0.5,
        };
        rate * recency
    }

    pub(crate) fn mark_used(&mut self, now: Instant) {
        self.last_used = Some(now);
    }

    pub(crate) fn record_success(&mut self, now: Instant, latency_ms: u64) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        #[allow(clippy::cast_precision_loss)]
        let sample = latency_ms as f64;
        self.latency_ms = Some(match self.latency_ms {
            Some(avg) => avg * 0.7 + sample * 0.3,
            None => sample,
        });
        // A success only forgives past strikes once the cooldown is over;
        // stragglers finishing during a cooldown leave it untouched.
        if !self.is_blacklisted(now) {
            self.blacklist_strikes = 0;
            self.blacklisted_until = None;
        }
    }

    /// Records a failure. Returns the cooldown if this failure tripped the
    /// blacklist.
    pub(crate) fn record_failure(&mut self, now: Instant, rule: &BlacklistRule) -> Option<Duration> {
        self.failure_count += 1;
        if self.is_blacklisted(now) {
            return None;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures < rule.failure_threshold.max(1) {
            return None;
        }
        let cooldown = rule.cooldown(self.blacklist_strikes);
        self.blacklisted_until = Some(now + cooldown);
        self.blacklist_strikes += 1;
        self.consecutive_failures = 0;
        Some(cooldown)
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.blacklist_strikes = 0;
        self.blacklisted_until = None;
    }
}
