//! Connection pooling and the per-host socket ceiling.
//!
//! A [`Pool`] owns the hyper clients (one per TLS verification mode) and one
//! semaphore per `scheme://host:port`. A request holds a permit from the
//! moment its connect phase starts until its response body is fully
//! consumed or dropped, so at most `max_sockets_per_host` exchanges run
//! against one origin at a time. Requests over the ceiling wait, and that
//! wait counts against their connect timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lazy_static::lazy_static;
use log::trace;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::error::RequestError;
use crate::providers::http_client_hyper::{new_client, HyperClient};

pub const DEFAULT_MAX_SOCKETS_PER_HOST: usize = 64;

lazy_static! {
    /// Backs [`Agent::Disabled`]: no reuse, no ceiling.
    static ref DIRECT: Pool = Pool::direct();
}

/// Which connection pool a request draws from.
#[derive(Clone, Debug, Default)]
pub enum Agent {
    /// The pool of the client that executes the request.
    #[default]
    Shared,
    /// A caller-owned pool.
    Pool(Pool),
    /// A fresh connection per request, closed afterwards.
    Disabled,
}

impl Agent {
    pub(crate) fn resolve(&self, shared: &Pool) -> Pool {
        match self {
            Agent::Shared => shared.clone(),
            Agent::Pool(pool) => pool.clone(),
            Agent::Disabled => DIRECT.clone(),
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        matches!(self, Agent::Disabled)
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Concurrent exchanges allowed per origin. `None` lifts the ceiling.
    pub max_sockets_per_host: Option<usize>,
    /// Idle keep-alive connections kept per origin. `0` disables reuse.
    pub max_idle_per_host: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets_per_host: Some(DEFAULT_MAX_SOCKETS_PER_HOST),
            max_idle_per_host: usize::MAX,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    verified: Mutex<Option<HyperClient>>,
    unverified: Mutex<Option<HyperClient>>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// The host slot of one in-flight request, reachable from outside the
/// request future so a cancel handle can free it at once.
#[derive(Clone, Debug, Default)]
pub(crate) struct Slot(Arc<Mutex<Option<OwnedSemaphorePermit>>>);

impl Slot {
    pub(crate) fn hold(&self, permit: Option<OwnedSemaphorePermit>) {
        *lock(&self.0) = permit;
    }

    pub(crate) fn take(&self) -> Option<OwnedSemaphorePermit> {
        lock(&self.0).take()
    }

    /// Frees the slot, returning whether one was held.
    pub(crate) fn release(&self) -> bool {
        self.take().is_some()
    }

    /// Frees the slot when the returned guard goes out of scope.
    pub(crate) fn release_on_drop(&self) -> SlotRelease<'_> {
        SlotRelease(self)
    }
}

pub(crate) struct SlotRelease<'a>(&'a Slot);

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A client ready to dispatch, plus the host slot it occupies.
pub(crate) struct Checkout {
    pub(crate) client: HyperClient,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                verified: Mutex::new(None),
                unverified: Mutex::new(None),
                hosts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A pool that never keeps connections around and never queues.
    pub fn direct() -> Self {
        Self::new(PoolConfig {
            max_sockets_per_host: None,
            max_idle_per_host: 0,
            idle_timeout: None,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Exchanges currently holding a slot for the origin of `url`.
    pub fn active(&self, url: &Url) -> usize {
        let Some(max) = self.inner.config.max_sockets_per_host else {
            return 0;
        };
        let hosts = lock(&self.inner.hosts);
        hosts
            .get(&origin_key(url))
            .map(|slots| max - slots.available_permits())
            .unwrap_or(0)
    }

    /// Waits for a free slot on the origin of `url`. Callers bound the wait
    /// with their connect timeout.
    pub(crate) async fn checkout(
        &self,
        url: &Url,
        reject_unauthorized: bool,
    ) -> Result<Checkout, RequestError> {
        let client = self.client(reject_unauthorized)?;
        let permit = match self.slots(url) {
            Some(slots) => {
                trace!(
                    "waiting for a slot on {} ({} free)",
                    origin_key(url),
                    slots.available_permits()
                );
                let permit = slots
                    .acquire_owned()
                    .await
                    .map_err(|e| RequestError::Transport {
                        cause: format!("connection pool closed: {e}"),
                    })?;
                Some(permit)
            }
            None => None,
        };
        Ok(Checkout { client, permit })
    }

    fn client(&self, reject_unauthorized: bool) -> Result<HyperClient, RequestError> {
        let cell = if reject_unauthorized {
            &self.inner.verified
        } else {
            &self.inner.unverified
        };
        let mut cell = lock(cell);
        if let Some(client) = cell.as_ref() {
            return Ok(client.clone());
        }
        let client = new_client(&self.inner.config, reject_unauthorized)?;
        *cell = Some(client.clone());
        Ok(client)
    }

    fn slots(&self, url: &Url) -> Option<Arc<Semaphore>> {
        let max = self.inner.config.max_sockets_per_host?;
        let key = origin_key(url);
        let mut hosts = lock(&self.inner.hosts);
        if !hosts.contains_key(&key) {
            // Outstanding permits and waiters keep a clone of the semaphore,
            // so a lone reference means the origin is idle.
            hosts.retain(|_, slots| Arc::strong_count(slots) > 1);
        }
        let slots = hosts
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(max)));
        Some(slots.clone())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new(PoolConfig::default())
    }
}

fn origin_key(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

// Nothing panics while these locks are held.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn origins_include_the_default_port() {
        assert_eq!(origin_key(&url("http://a.test/x")), "http://a.test:80");
        assert_eq!(origin_key(&url("https://a.test/x")), "https://a.test:443");
        assert_eq!(origin_key(&url("http://a.test:8080/")), "http://a.test:8080");
    }

    #[tokio::test]
    async fn ceiling_is_per_origin() -> anyhow::Result<()> {
        let pool = Pool::new(PoolConfig {
            max_sockets_per_host: Some(1),
            ..PoolConfig::default()
        });
        let a = url("http://a.test/");
        let b = url("http://b.test/");

        let first = pool.checkout(&a, true).await?;
        assert_eq!(pool.active(&a), 1);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), pool.checkout(&a, true)).await;
        assert!(blocked.is_err());

        let other = pool.checkout(&b, true).await?;
        assert_eq!(pool.active(&b), 1);

        drop(first);
        assert_eq!(pool.active(&a), 0);
        let _again = pool.checkout(&a, true).await?;
        drop(other);
        Ok(())
    }

    #[tokio::test]
    async fn idle_origins_are_pruned() -> anyhow::Result<()> {
        let pool = Pool::default();
        let a = url("http://a.test/");
        let held = pool.checkout(&a, true).await?;
        drop(pool.checkout(&url("http://b.test/"), true).await?);
        assert_eq!(lock(&pool.inner.hosts).len(), 2);

        let _c = pool.checkout(&url("http://c.test/"), true).await?;
        let hosts: Vec<String> = lock(&pool.inner.hosts).keys().cloned().collect();
        assert_eq!(hosts.len(), 2);
        assert!(!hosts.contains(&"http://b.test:80".to_string()));
        assert_eq!(pool.active(&a), 1);
        drop(held);
        Ok(())
    }

    #[test]
    fn verification_modes_use_separate_clients() -> anyhow::Result<()> {
        let pool = Pool::default();
        pool.client(true)?;
        assert!(lock(&pool.inner.verified).is_some());
        assert!(lock(&pool.inner.unverified).is_none());

        pool.client(false)?;
        assert!(lock(&pool.inner.unverified).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn slot_release_frees_the_host() -> anyhow::Result<()> {
        let pool = Pool::new(PoolConfig {
            max_sockets_per_host: Some(1),
            ..PoolConfig::default()
        });
        let a = url("http://a.test/");
        let slot = Slot::default();
        slot.hold(pool.checkout(&a, true).await?.permit);
        assert_eq!(pool.active(&a), 1);
        assert!(slot.release());
        assert_eq!(pool.active(&a), 0);
        assert!(!slot.release());

        slot.hold(pool.checkout(&a, true).await?.permit);
        {
            let _guard = slot.release_on_drop();
        }
        assert_eq!(pool.active(&a), 0);
        Ok(())
    }

    #[tokio::test]
    async fn direct_pool_has_no_ceiling() -> anyhow::Result<()> {
        let pool = Pool::direct();
        let a = url("http://a.test/");
        let checkout = pool.checkout(&a, true).await?;
        assert!(checkout.permit.is_none());
        assert_eq!(pool.active(&a), 0);
        Ok(())
    }
}
