//! Egress proxy pool with health tracking, blacklisting and pairing cache.
//!
//! [`ProxyManager::next`] picks a proxy for a backend (or [`ProxyChoice::Direct`]),
//! [`ProxyManager::report`] feeds back the outcome. Each entry sits behind its
//! own mutex; there is no pool-wide lock.
//!
//! # Example
//!
//! ```
//! use tracksync_core::proxy::{ProxyChoice, ProxyManager, ProxyPolicy};
//!
//! let manager = ProxyManager::new(ProxyPolicy::default());
//! manager.add_all(["10.0.0.1:8080", "10.0.0.2:3128"]);
//!
//! let choice = manager.next("ezconv");
//! manager.report("ezconv", &choice, true, 420);
//! assert!(!matches!(choice, ProxyChoice::Direct));
//! ```

mod entry;
mod source;

pub use entry::{ProxyAddress, ProxyEntry, ProxyProtocol};
pub use source::{DEFAULT_LIVENESS_TIMEOUT, DEFAULT_REFRESH_INTERVAL, ProxySource};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::DownloadError;
use entry::BlacklistRule;

/// Errors from proxy parsing and list sourcing.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A proxy line could not be parsed.
    #[error("invalid proxy address: {input:?}")]
    InvalidAddress {
        /// The rejected input.
        input: String,
    },

    /// A proxy list could not be downloaded.
    #[error("failed to fetch proxy list {url}: {source}")]
    Fetch {
        /// The list URL.
        url: String,
        /// The underlying HTTP error.
        #[source]
        source: DownloadError,
    },
}

impl ProxyError {
    pub fn invalid_address(input: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, source: DownloadError) -> Self {
        Self::Fetch {
            url: url.into(),
            source,
        }
    }
}

/// What a caller should route through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyChoice {
    /// No proxy.
    Direct,
    /// Route through this proxy.
    Proxy(ProxyAddress),
}

impl ProxyChoice {
    /// Proxy URL, or `None` for a direct connection.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        match self {
            Self::Direct => None,
            Self::Proxy(address) => Some(address.url()),
        }
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for ProxyChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Proxy(address) => write!(f, "{address}"),
        }
    }
}

/// Proxy selection and blacklisting knobs.
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    /// When false, [`ProxyManager::next`] always answers `Direct`.
    pub enabled: bool,
    /// Consecutive failures that blacklist an entry.
    pub failure_threshold: u32,
    /// First blacklist cooldown.
    pub base_cooldown: Duration,
    /// Multiplier applied to the cooldown on each repeated blacklisting.
    pub growth_factor: f64,
    /// Upper bound for any cooldown.
    pub max_cooldown: Duration,
    /// How long a successful (backend, proxy) pairing stays preferred.
    pub pairing_ttl: Duration,
    /// Number of best-scoring entries considered for the weighted pick.
    pub top_k: usize,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            base_cooldown: Duration::from_secs(120),
            growth_factor: 2.0,
            max_cooldown: Duration::from_secs(3600),
            pairing_ttl: Duration::from_secs(600),
            top_k: 5,
        }
    }
}

impl ProxyPolicy {
    fn blacklist_rule(&self) -> BlacklistRule {
        BlacklistRule {
            failure_threshold: self.failure_threshold,
            base_cooldown: self.base_cooldown,
            growth_factor: self.growth_factor,
            max_cooldown: self.max_cooldown,
        }
    }
}

/// Point-in-time view of one entry, produced by [`ProxyManager::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySnapshot {
    pub address: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub blacklisted: bool,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone)]
struct Pairing {
    address: ProxyAddress,
    expires_at: Instant,
}

/// Process-wide proxy pool.
///
/// Build one at startup, share it behind `Arc`, call
/// [`ProxyManager::shutdown`] on the way out.
#[derive(Debug)]
pub struct ProxyManager {
    policy: ProxyPolicy,
    entries: DashMap<ProxyAddress, Arc<Mutex<ProxyEntry>>>,
    pairings: DashMap<String, Pairing>,
}

fn lock(entry: &Mutex<ProxyEntry>) -> MutexGuard<'_, ProxyEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProxyManager {
    #[must_use]
    pub fn new(policy: ProxyPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
            pairings: DashMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    /// Adds a proxy. Known addresses keep their stats. Returns true if new.
    pub fn add(&self, address: ProxyAddress) -> bool {
        let mut inserted = false;
        self.entries.entry(address.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(ProxyEntry::new(address)))
        });
        inserted
    }

    /// Parses and adds every line; unparseable lines are logged and skipped.
    /// Returns the number of new entries.
    pub fn add_all<I, S>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyAddress::parse(line) {
                Ok(address) => {
                    if self.add(address) {
                        added += 1;
                    }
                }
                Err(error) => debug!(%error, "skipping proxy line"),
            }
        }
        added
    }

    /// True when `address` is already pooled.
    #[must_use]
    pub fn contains(&self, address: &ProxyAddress) -> bool {
        self.entries.contains_key(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, address: &ProxyAddress) -> Option<Arc<Mutex<ProxyEntry>>> {
        self.entries.get(address).map(|e| Arc::clone(e.value()))
    }

    /// Picks the egress for the next call to `backend`.
    ///
    /// A live pairing for the backend wins. Otherwise a weighted random pick
    /// among the `top_k` best-scoring non-blacklisted entries. `Direct` when
    /// the pool is empty, disabled, or entirely blacklisted.
    #[instrument(skip(self))]
    pub fn next(&self, backend: &str) -> ProxyChoice {
        if !self.policy.enabled {
            return ProxyChoice::Direct;
        }
        let now = Instant::now();

        if let Some(choice) = self.paired(backend, now) {
            debug!(proxy = %choice, "reusing known-good pairing");
            return choice;
        }

        // Clone the Arcs out first so no map shard is held while entries lock.
        let handles: Vec<Arc<Mutex<ProxyEntry>>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut scored: Vec<(f64, Arc<Mutex<ProxyEntry>>)> = handles
            .into_iter()
            .filter_map(|handle| {
                let score = {
                    let entry = lock(&handle);
                    if entry.is_blacklisted(now) {
                        return None;
                    }
                    entry.score(now)
                };
                Some((score, handle))
            })
            .collect();

        if scored.is_empty() {
            debug!("no selectable proxy, using direct connection");
            return ProxyChoice::Direct;
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.policy.top_k.max(1));

        let index = WeightedIndex::new(scored.iter().map(|(score, _)| *score))
            .map_or(0, |dist| dist.sample(&mut rand::thread_rng()));

        // Re-check under the lock: a reporter may have blacklisted it since.
        for (_, handle) in scored.iter().cycle().skip(index).take(scored.len()) {
            let mut entry = lock(handle);
            if entry.is_blacklisted(now) {
                continue;
            }
            entry.mark_used(now);
            let choice = ProxyChoice::Proxy(entry.address().clone());
            debug!(proxy = %choice, "selected proxy");
            return choice;
        }
        ProxyChoice::Direct
    }

    fn paired(&self, backend: &str, now: Instant) -> Option<ProxyChoice> {
        let pairing = self.pairings.get(backend).map(|p| p.value().clone())?;
        if pairing.expires_at <= now {
            self.pairings.remove(backend);
            return None;
        }
        let handle = self.entry(&pairing.address)?;
        let mut entry = lock(&handle);
        if entry.is_blacklisted(now) {
            return None;
        }
        entry.mark_used(now);
        Some(ProxyChoice::Proxy(pairing.address))
    }

    /// Feeds back the outcome of a call made through `choice`.
    #[instrument(skip(self), fields(proxy = %choice))]
    pub fn report(&self, backend: &str, choice: &ProxyChoice, success: bool, latency_ms: u64) {
        let ProxyChoice::Proxy(address) = choice else {
            return;
        };
        let Some(handle) = self.entry(address) else {
            return;
        };
        let now = Instant::now();

        if success {
            lock(&handle).record_success(now, latency_ms);
            self.pairings.insert(
                backend.to_string(),
                Pairing {
                    address: address.clone(),
                    expires_at: now + self.policy.pairing_ttl,
                },
            );
            return;
        }

        let tripped = lock(&handle).record_failure(now, &self.policy.blacklist_rule());
        self.pairings
            .remove_if(backend, |_, pairing| &pairing.address == address);
        if let Some(cooldown) = tripped {
            warn!(
                proxy = %address,
                cooldown_secs = cooldown.as_secs(),
                "proxy blacklisted"
            );
        }
    }

    /// Clears the blacklist and failure streak of one proxy.
    pub fn reset(&self, address: &ProxyAddress) -> bool {
        match self.entry(address) {
            Some(handle) => {
                lock(&handle).reset();
                true
            }
            None => false,
        }
    }

    /// Copies out the current stats of every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let now = Instant::now();
        let handles: Vec<Arc<Mutex<ProxyEntry>>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut snapshot: Vec<ProxySnapshot> = handles
            .iter()
            .map(|handle| {
                let entry = lock(handle);
                ProxySnapshot {
                    address: entry.address().to_string(),
                    success_count: entry.success_count(),
                    failure_count: entry.failure_count(),
                    blacklisted: entry.is_blacklisted(now),
                    latency_ms: entry.latency_ms(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.address.cmp(&b.address));
        snapshot
    }

    /// Drops pairings and logs a final snapshot. Returns that snapshot.
    pub fn shutdown(&self) -> Vec<ProxySnapshot> {
        self.pairings.clear();
        let snapshot = self.snapshot();
        let blacklisted = snapshot.iter().filter(|s| s.blacklisted).count();
        info!(
            proxies = snapshot.len(),
            blacklisted,
            "proxy pool shut down"
        );
        snapshot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn policy(threshold: u32, cooldown: Duration) -> ProxyPolicy {
        ProxyPolicy {
            failure_threshold: threshold,
            base_cooldown: cooldown,
            ..ProxyPolicy::default()
        }
    }

    fn address(s: &str) -> ProxyAddress {
        ProxyAddress::parse(s).unwrap()
    }

    #[test]
    fn test_empty_pool_is_direct() {
        let manager = ProxyManager::new(ProxyPolicy::default());
        assert_eq!(manager.next("ezconv"), ProxyChoice::Direct);
    }

    #[test]
    fn test_disabled_policy_is_direct() {
        let manager = ProxyManager::new(ProxyPolicy {
            enabled: false,
            ..ProxyPolicy::default()
        });
        manager.add_all(["h:1"]);
        assert_eq!(manager.next("ezconv"), ProxyChoice::Direct);
    }

    #[test]
    fn test_add_all_skips_duplicates_and_garbage() {
        let manager = ProxyManager::new(ProxyPolicy::default());
        let added = manager.add_all(["h:1", "h:1", "# comment", "", "bogus", "http://h:1", "g:2"]);
        assert_eq!(added, 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_blacklisted_proxy_never_returned_until_cooldown() {
        let manager = ProxyManager::new(policy(3, Duration::from_millis(150)));
        manager.add_all(["bad:1"]);
        let bad = ProxyChoice::Proxy(address("bad:1"));
        for _ in 0..3 {
            manager.report("pullmp3", &bad, false, 0);
        }
        for _ in 0..50 {
            assert_eq!(manager.next("pullmp3"), ProxyChoice::Direct);
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(manager.next("pullmp3"), bad);
    }

    #[test]
    fn test_blacklist_excludes_only_failed_entry() {
        let manager = ProxyManager::new(policy(2, Duration::from_secs(60)));
        manager.add_all(["bad:1", "good:1"]);
        let bad = ProxyChoice::Proxy(address("bad:1"));
        manager.report("ezconv", &bad, false, 0);
        manager.report("ezconv", &bad, false, 0);
        for _ in 0..50 {
            assert_eq!(manager.next("spotdown"), ProxyChoice::Proxy(address("good:1")));
        }
    }

    #[test]
    fn test_successful_pairing_is_preferred() {
        let manager = ProxyManager::new(ProxyPolicy::default());
        manager.add_all(["a:1", "b:1", "c:1", "d:1"]);
        let chosen = ProxyChoice::Proxy(address("c:1"));
        manager.report("ezconv", &chosen, true, 120);
        for _ in 0..20 {
            assert_eq!(manager.next("ezconv"), chosen);
        }
    }

    #[test]
    fn test_failure_drops_pairing() {
        let manager = ProxyManager::new(policy(10, Duration::from_secs(60)));
        manager.add_all(["a:1", "b:1"]);
        let a = ProxyChoice::Proxy(address("a:1"));
        manager.report("ezconv", &a, true, 100);
        manager.report("ezconv", &a, false, 0);
        let picks: HashSet<ProxyChoice> = (0..200).map(|_| manager.next("ezconv")).collect();
        assert_eq!(picks.len(), 2, "both proxies should be selectable again");
    }

    #[test]
    fn test_reset_clears_blacklist() {
        let manager = ProxyManager::new(policy(1, Duration::from_secs(600)));
        manager.add_all(["a:1"]);
        let a = ProxyChoice::Proxy(address("a:1"));
        manager.report("x", &a, false, 0);
        assert_eq!(manager.next("x"), ProxyChoice::Direct);
        assert!(manager.reset(&address("a:1")));
        assert_eq!(manager.next("x"), a);
    }

    #[test]
    fn test_concurrent_reports_are_not_lost() {
        let manager = Arc::new(ProxyManager::new(policy(u32::MAX, Duration::from_secs(1))));
        manager.add_all(["a:1"]);
        let a = ProxyChoice::Proxy(address("a:1"));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let a = a.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        manager.report("x", &a, i % 2 == 0, 10);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        let snapshot = manager.shutdown();
        assert_eq!(snapshot[0].success_count + snapshot[0].failure_count, 2000);
        assert_eq!(snapshot[0].success_count, 1000);
    }

    #[test]
    fn test_growth_factor_parameterized() {
        for growth in [1.5_f64, 2.0, 4.0] {
            let manager = ProxyManager::new(ProxyPolicy {
                failure_threshold: 1,
                base_cooldown: Duration::from_millis(40),
                growth_factor: growth,
                ..ProxyPolicy::default()
            });
            manager.add_all(["a:1"]);
            let a = ProxyChoice::Proxy(address("a:1"));
            manager.report("x", &a, false, 0);
            std::thread::sleep(Duration::from_millis(60));
            assert_eq!(manager.next("x"), a, "first cooldown over for growth {growth}");
            manager.report("x", &a, false, 0);
            // second cooldown is 40ms * growth >= 60ms
            std::thread::sleep(Duration::from_millis(45));
            assert_eq!(manager.next("x"), ProxyChoice::Direct, "growth {growth}");
        }
    }
}
