//! A bounded pool of collection clients.
//!
//! The pool is what provides concurrency: callers lease a whole client,
//! run one exchange through it, and hand it back. Admission runs through a
//! semaphore sized to the pool, with an optional pure-polling mode for
//! callers that want the semaphore out of the way.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout_at, Instant};

use crate::base::GatherError;
use crate::client::GatherClient;
use crate::config::{derive_configuration, ConnProfile};
use crate::socket::ProxySettings;
use crate::transport::TransportFactory;

/// Tunables for pool admission and the transports behind the pool.
///
/// Out-of-range values are silently corrected back to their defaults at
/// construction time; pool sizing is likewise clamped, not rejected. This is
/// deliberately looser than profile validation, which hard-rejects.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle-connection budget for the pool's transports. Zero means "equal
    /// to the pool size".
    pub max_idle_conns: usize,
    /// Fraction of the idle budget a single host may occupy, in (0, 1].
    pub max_idle_per_host_ratio: f64,
    /// How long `acquire` waits for a free instance, in seconds.
    pub timeout_secs: u64,
    /// Rescan interval for the polling acquisition path, in milliseconds.
    pub retry_interval_ms: u64,
    /// Hard upper bound on pool size.
    pub max_pool_size: usize,
    /// When false, acquisition degrades to pure polling.
    pub use_semaphore: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 0,
            max_idle_per_host_ratio: 0.2,
            timeout_secs: 30,
            retry_interval_ms: 100,
            max_pool_size: 100,
            use_semaphore: true,
        }
    }
}

impl PoolConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_idle_per_host_ratio <= 0.0 || self.max_idle_per_host_ratio > 1.0 {
            self.max_idle_per_host_ratio = defaults.max_idle_per_host_ratio;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = defaults.timeout_secs;
        }
        if self.retry_interval_ms < 10 || self.retry_interval_ms > 1000 {
            self.retry_interval_ms = defaults.retry_interval_ms;
        }
        if self.max_pool_size == 0 {
            self.max_pool_size = defaults.max_pool_size;
        }
        self
    }
}

struct Shared {
    clients: Vec<GatherClient>,
    free: DashMap<usize, bool>,
    semaphore: Option<Arc<Semaphore>>,
    config: PoolConfig,
}

/// A fixed-size pool of [`GatherClient`] instances.
pub struct ClientPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("size", &self.shared.clients.len())
            .field("use_semaphore", &self.shared.config.use_semaphore)
            .finish()
    }
}

impl ClientPool {
    /// Build a pool of `size` clients with default pool tunables.
    ///
    /// `headers` follows the client rules (a lone `User-Agent` is completed
    /// to a browser fingerprint); `timeout_secs` is the per-request total
    /// deadline and also the basis for the snappy timeout profile the pool's
    /// transports run under, and must be greater than zero. `size` is
    /// clamped into `[1, MaxPoolSize]`.
    pub fn new(
        headers: DashMap<String, String>,
        proxy_url: &str,
        timeout_secs: u64,
        cookie_log: bool,
        size: usize,
    ) -> Result<Self, GatherError> {
        Self::with_config(
            headers,
            proxy_url,
            timeout_secs,
            cookie_log,
            size,
            PoolConfig::default(),
        )
    }

    /// Build a pool with explicit tunables.
    pub fn with_config(
        headers: DashMap<String, String>,
        proxy_url: &str,
        timeout_secs: u64,
        cookie_log: bool,
        size: usize,
        config: PoolConfig,
    ) -> Result<Self, GatherError> {
        let config = config.sanitized();
        let size = size.clamp(1, config.max_pool_size);
        let idle_budget = if config.max_idle_conns == 0 {
            size
        } else {
            config.max_idle_conns
        };

        // Pools target responsive endpoints: derive a snappy profile from
        // the per-request deadline instead of touching the global registry,
        // so building a pool never reconfigures unrelated clients. A zero
        // deadline is a caller error and is rejected by the derivation.
        let base = derive_configuration(
            Duration::from_secs(timeout_secs),
            ConnProfile::Snappy,
            true,
        )?;
        let cfg = Arc::new(base.with_idle_budget(idle_budget, config.max_idle_per_host_ratio));

        let factory = TransportFactory::global();
        let proxy = if proxy_url.is_empty() {
            None
        } else {
            Some(ProxySettings::parse(proxy_url)?)
        };

        // Direct pools share one transport sized for the whole pool; proxied
        // pools give each instance its own, keeping tunnel state isolated.
        let shared_transport = match proxy {
            None => Some(factory.build_dedicated(Arc::clone(&cfg), None)?),
            Some(_) => None,
        };

        let total_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        let mut clients = Vec::with_capacity(size);
        let free = DashMap::new();
        for index in 0..size {
            let transport = match &shared_transport {
                Some(t) => Arc::clone(t),
                None => factory.build_dedicated(
                    Arc::clone(&cfg),
                    proxy.clone(),
                )?,
            };
            clients.push(GatherClient::from_transport(
                transport,
                clone_headers(&headers),
                total_timeout,
                cookie_log,
            ));
            free.insert(index, true);
        }

        let semaphore = config
            .use_semaphore
            .then(|| Arc::new(Semaphore::new(size)));

        tracing::debug!(size, proxied = proxy.is_some(), "client pool built");
        Ok(Self {
            shared: Arc::new(Shared {
                clients,
                free,
                semaphore,
                config,
            }),
        })
    }

    /// Number of instances in the pool.
    pub fn size(&self) -> usize {
        self.shared.clients.len()
    }

    /// Lease a client, waiting up to the configured acquisition timeout.
    pub async fn acquire(&self) -> Result<LeasedClient, GatherError> {
        self.acquire_within(Duration::from_secs(self.shared.config.timeout_secs))
            .await
    }

    /// Lease a client within an explicit budget.
    ///
    /// With the semaphore enabled, a permit guarantees a free index exists
    /// by the time we scan. Without it, acquisition is a fixed-interval
    /// rescan until the budget runs out.
    pub async fn acquire_within(&self, budget: Duration) -> Result<LeasedClient, GatherError> {
        let deadline = Instant::now() + budget;

        let permit = match &self.shared.semaphore {
            Some(sem) => match timeout_at(deadline, Arc::clone(sem).acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) | Err(_) => return Err(GatherError::NoFreeClient),
            },
            None => None,
        };

        loop {
            if let Some(index) = self.try_claim() {
                return Ok(LeasedClient {
                    shared: Arc::clone(&self.shared),
                    index,
                    _permit: permit,
                });
            }
            if Instant::now() >= deadline {
                return Err(GatherError::NoFreeClient);
            }
            sleep(Duration::from_millis(self.shared.config.retry_interval_ms)).await;
        }
    }

    /// Atomically claim the first free index, if any.
    fn try_claim(&self) -> Option<usize> {
        for mut entry in self.shared.free.iter_mut() {
            if *entry.value() {
                *entry.value_mut() = false;
                return Some(*entry.key());
            }
        }
        None
    }

    /// GET through a leased instance.
    pub async fn get(&self, url: &str, referer: &str) -> Result<(String, String), GatherError> {
        let client = self.acquire().await?;
        client.get(url, referer).await
    }

    /// GET with an explicit cookie line through a leased instance.
    pub async fn get_with_cookies(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
    ) -> Result<(String, String), GatherError> {
        let client = self.acquire().await?;
        client.get_with_cookies(url, referer, cookies).await
    }

    /// POST an urlencoded form through a leased instance.
    pub async fn post(
        &self,
        url: &str,
        referer: &str,
        form: &[(&str, &str)],
    ) -> Result<(String, String), GatherError> {
        let client = self.acquire().await?;
        client.post(url, referer, form).await
    }

    /// POST with an explicit cookie line through a leased instance.
    pub async fn post_with_cookies(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        form: &[(&str, &str)],
    ) -> Result<(String, String), GatherError> {
        let client = self.acquire().await?;
        client.post_with_cookies(url, referer, cookies, form).await
    }
}

fn clone_headers(src: &DashMap<String, String>) -> DashMap<String, String> {
    let out = DashMap::new();
    for entry in src.iter() {
        out.insert(entry.key().clone(), entry.value().clone());
    }
    out
}

/// An exclusive lease on one pooled client, released on drop.
pub struct LeasedClient {
    shared: Arc<Shared>,
    index: usize,
    // Dropped after the Drop body below, so the index is marked free before
    // the next waiter is admitted.
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for LeasedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedClient")
            .field("index", &self.index)
            .finish()
    }
}

impl Deref for LeasedClient {
    type Target = GatherClient;

    fn deref(&self) -> &GatherClient {
        &self.shared.clients[self.index]
    }
}

impl Drop for LeasedClient {
    fn drop(&mut self) {
        if let Some(mut flag) = self.shared.free.get_mut(&self.index) {
            *flag = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ua_headers() -> DashMap<String, String> {
        let headers = DashMap::new();
        headers.insert("User-Agent".to_string(), "chrome".to_string());
        headers
    }

    #[test]
    fn pool_size_is_clamped_not_rejected() {
        let small = ClientPool::new(ua_headers(), "", 30, false, 0).unwrap();
        assert_eq!(small.size(), 1);

        let large = ClientPool::new(ua_headers(), "", 30, false, 500).unwrap();
        assert_eq!(large.size(), 100);
    }

    #[test]
    fn zero_request_timeout_is_rejected_not_defaulted() {
        let err = ClientPool::new(ua_headers(), "", 0, false, 2).unwrap_err();
        assert!(matches!(err, GatherError::InvalidConfig(_)));
    }

    #[test]
    fn out_of_range_tunables_fall_back_to_defaults() {
        let cfg = PoolConfig {
            max_idle_per_host_ratio: -0.5,
            timeout_secs: 0,
            retry_interval_ms: 5,
            max_pool_size: 0,
            ..PoolConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.max_idle_per_host_ratio, 0.2);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.retry_interval_ms, 100);
        assert_eq!(cfg.max_pool_size, 100);
    }

    #[tokio::test]
    async fn leases_are_exclusive_until_dropped() {
        let pool = ClientPool::new(ua_headers(), "", 30, false, 2).unwrap();
        let a = pool.acquire_within(Duration::from_millis(200)).await.unwrap();
        let b = pool.acquire_within(Duration::from_millis(200)).await.unwrap();
        assert_ne!(a.index, b.index);

        let exhausted = pool.acquire_within(Duration::from_millis(200)).await;
        assert!(matches!(exhausted, Err(GatherError::NoFreeClient)));

        drop(a);
        let c = pool.acquire_within(Duration::from_millis(200)).await.unwrap();
        assert_eq!(c.index, 0);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn polling_mode_still_times_out_and_recovers() {
        let pool = ClientPool::with_config(
            ua_headers(),
            "",
            30,
            false,
            1,
            PoolConfig {
                use_semaphore: false,
                retry_interval_ms: 10,
                ..PoolConfig::default()
            },
        )
        .unwrap();

        let held = pool.acquire_within(Duration::from_millis(100)).await.unwrap();
        let err = pool
            .acquire_within(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_no_free_client());

        drop(held);
        assert!(pool.acquire_within(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn release_wakes_a_waiting_acquirer() {
        let pool = Arc::new(ClientPool::new(ua_headers(), "", 30, false, 1).unwrap());
        let held = pool.acquire_within(Duration::from_millis(100)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_within(Duration::from_secs(2)).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
