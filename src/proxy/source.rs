//! Refreshes the proxy pool from remote `host:port` lists.

use std::time::{Duration, Instant};

use futures_util::{FutureExt, StreamExt, stream};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ProxyAddress, ProxyError, ProxyManager};
use crate::download::HttpClient;

/// Minimum time between two list refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Time budget for one liveness request through a candidate proxy.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(8);

/// Liveness requests in flight at once.
const LIVENESS_PARALLELISM: usize = 16;

#[derive(Debug, Clone)]
struct LivenessCheck {
    url: String,
    timeout: Duration,
}

/// Remote proxy lists plus a static seed list.
#[derive(Debug)]
pub struct ProxySource {
    list_urls: Vec<String>,
    static_proxies: Vec<String>,
    min_interval: Duration,
    liveness: Option<LivenessCheck>,
    last_refresh: Mutex<Option<Instant>>,
}

impl ProxySource {
    #[must_use]
    pub fn new(list_urls: Vec<String>, static_proxies: Vec<String>) -> Self {
        Self {
            list_urls,
            static_proxies,
            min_interval: DEFAULT_REFRESH_INTERVAL,
            liveness: None,
            last_refresh: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Only pool list entries that can fetch `url` within `timeout`.
    /// Static proxies and already pooled entries are not checked.
    #[must_use]
    pub fn with_liveness_check(mut self, url: impl Into<String>, timeout: Duration) -> Self {
        self.liveness = Some(LivenessCheck {
            url: url.into(),
            timeout,
        });
        self
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Merges the static list and every remote list into `manager`.
    ///
    /// Does nothing (returns `Ok(0)`) when the previous refresh is younger
    /// than the minimum interval, unless `force` is set. A failing list is
    /// logged and skipped; the error is returned only when every list failed
    /// and nothing was added.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Fetch`] for the last failing list when all of them failed.
    #[instrument(skip(self, client, manager))]
    pub async fn refresh(
        &self,
        client: &HttpClient,
        manager: &ProxyManager,
        force: bool,
    ) -> Result<usize, ProxyError> {
        let mut last = self.last_refresh.lock().await;
        if !force && last.is_some_and(|at| at.elapsed() < self.min_interval) {
            return Ok(0);
        }

        let mut added = manager.add_all(&self.static_proxies);
        let mut last_error = None;
        let mut fetched_any = self.list_urls.is_empty();

        for url in &self.list_urls {
            match client.get_text(url).await {
                Ok(body) => {
                    fetched_any = true;
                    added += self.admit(client, manager, &body).await;
                }
                Err(source) => {
                    warn!(url = %url, error = %source, "proxy list unavailable");
                    last_error = Some(ProxyError::fetch(url, source));
                }
            }
        }
        *last = Some(Instant::now());

        if !fetched_any
            && added == 0
            && let Some(error) = last_error
        {
            return Err(error);
        }
        info!(added, pool = manager.len(), "proxy pool refreshed");
        Ok(added)
    }

    /// Adds the unknown entries of one list body, after the liveness check
    /// when one is configured.
    async fn admit(&self, client: &HttpClient, manager: &ProxyManager, body: &str) -> usize {
        let Some(check) = &self.liveness else {
            return manager.add_all(body.lines());
        };
        let mut fresh: Vec<ProxyAddress> = Vec::new();
        for line in body.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyAddress::parse(line) {
                Ok(address) if !manager.contains(&address) && !fresh.contains(&address) => {
                    fresh.push(address);
                }
                Ok(_) => {}
                Err(error) => debug!(%error, "skipping proxy line"),
            }
        }

        let checked = fresh.len();
        let live: Vec<ProxyAddress> = stream::iter(fresh)
            .map(|address| {
                async move {
                    match client.reachable_via(&check.url, &address, check.timeout).await {
                        Ok(()) => Some(address),
                        Err(error) => {
                            debug!(proxy = %address, error = %error, "proxy failed liveness check");
                            None
                        }
                    }
                }
                .boxed()
            })
            .buffer_unordered(LIVENESS_PARALLELISM)
            .filter_map(|live| async move { live })
            .collect()
            .await;
        debug!(checked, live = live.len(), "liveness check finished");
        live.into_iter().filter(|address| manager.add(address.clone())).count()
    }

    /// Refreshes every `min_interval` until `cancel` fires. The first
    /// refresh happens one interval after the call; startup is expected to
    /// have forced one already.
    pub async fn refresh_periodically(
        &self,
        client: &HttpClient,
        manager: &ProxyManager,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.min_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.refresh(client, manager, false).await {
                warn!(error = %error, "scheduled proxy refresh failed");
            }
        }
        debug!("proxy refresh loop stopped");
    }
}
