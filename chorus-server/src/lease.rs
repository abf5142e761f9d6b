//! Lease Manager
//!
//! A lease owns a set of keys and renews their expiry every `ttl`, pushing it
//! out to `1.5 * ttl`. A key bound to a live lease never expires; once the
//! owning process stops renewing, every key is gone within one more `ttl`.

use async_trait::async_trait;
use chorus_shared::config::lease_expiry;
use chorus_shared::config::defaults;
use chorus_shared::{store_call, ChorusError, ChorusResult, KeyValueStore};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backing store operations a lease needs
#[async_trait]
pub trait ExpiringKeys: Send + Sync {
    async fn expire_keys(&self, keys: &[String], ttl: Duration) -> ChorusResult<()>;

    async fn delete_keys(&self, keys: &[String]) -> ChorusResult<u64>;
}

/// The fields of one named hash, seen as leasable keys
#[derive(Clone)]
pub struct DistributedHash {
    kv: Arc<dyn KeyValueStore>,
    name: String,
}

impl DistributedHash {
    pub fn new(kv: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        Self {
            kv,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ExpiringKeys for DistributedHash {
    async fn expire_keys(&self, keys: &[String], ttl: Duration) -> ChorusResult<()> {
        self.kv.hexpire(&self.name, keys, ttl).await
    }

    async fn delete_keys(&self, keys: &[String]) -> ChorusResult<u64> {
        self.kv.hdel(&self.name, keys).await
    }
}

struct LeaseInner {
    ttl: Duration,
    store_timeout: Duration,
    keys: RwLock<BTreeSet<String>>,
    target: Arc<dyn ExpiringKeys>,
    shutdown: CancellationToken,
}

impl LeaseInner {
    async fn renew(&self) -> ChorusResult<()> {
        let keys: Vec<String> = self.keys.read().await.iter().cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }
        debug!("Renewing {} leased keys", keys.len());
        store_call(
            self.store_timeout,
            "lease renew",
            self.target.expire_keys(&keys, lease_expiry(self.ttl)),
        )
        .await
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a running lease; clones share the same key set
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Start a lease with no bound keys. Must be called inside a tokio runtime.
    pub fn new(ttl: Duration, target: Arc<dyn ExpiringKeys>) -> Self {
        Self::with_store_timeout(ttl, target, defaults::store_timeout())
    }

    pub fn with_store_timeout(
        ttl: Duration,
        target: Arc<dyn ExpiringKeys>,
        store_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(LeaseInner {
            ttl,
            store_timeout,
            keys: RwLock::new(BTreeSet::new()),
            target,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(renewal_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            ttl,
        ));
        Self { inner }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn is_active(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    pub async fn add_key(&self, key: impl Into<String>) -> ChorusResult<()> {
        self.add_keys([key.into()]).await
    }

    /// Bind keys for renewal. Keys already bound are left alone; new keys get
    /// their first expiry right away so they self-expire even if this process
    /// dies before the next renewal tick.
    pub async fn add_keys<I>(&self, keys: I) -> ChorusResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        if !self.is_active() {
            return Err(ChorusError::internal("lease is no longer active"));
        }

        let added: Vec<String> = {
            let mut bound = self.inner.keys.write().await;
            keys.into_iter().filter(|k| bound.insert(k.clone())).collect()
        };
        if added.is_empty() {
            return Ok(());
        }

        store_call(
            self.inner.store_timeout,
            "lease add_key",
            self.inner
                .target
                .expire_keys(&added, lease_expiry(self.inner.ttl)),
        )
        .await
    }

    /// Stop renewing `key` without deleting it; returns whether it was bound
    pub async fn remove_key(&self, key: &str) -> bool {
        self.inner.keys.write().await.remove(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.keys.read().await.iter().cloned().collect()
    }

    /// Push out the expiry of every bound key now
    pub async fn renew(&self) -> ChorusResult<()> {
        self.inner.renew().await
    }

    /// Stop renewal and delete every bound key. Best effort: expiry is the
    /// backstop if the delete does not go through.
    pub async fn destroy(&self) -> ChorusResult<()> {
        self.inner.shutdown.cancel();
        let keys: Vec<String> = std::mem::take(&mut *self.inner.keys.write().await)
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let deleted = store_call(
            self.inner.store_timeout,
            "lease destroy",
            self.inner.target.delete_keys(&keys),
        )
        .await?;
        info!("Lease destroyed, deleted {} of {} keys", deleted, keys.len());
        Ok(())
    }

    /// Stop renewal and leave every key to expire on its own
    pub async fn abandon(&self) {
        self.inner.shutdown.cancel();
        let keys = std::mem::take(&mut *self.inner.keys.write().await);
        warn!("Lease abandoned with {} keys left to expire", keys.len());
    }
}

async fn renewal_loop(lease: Weak<LeaseInner>, shutdown: CancellationToken, ttl: Duration) {
    let mut ticker = interval_at(Instant::now() + ttl, ttl);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = lease.upgrade() else { break };
                if let Err(e) = inner.renew().await {
                    error!("Lease renewal failed, keys may expire: {}", e);
                }
            }
        }
    }
    debug!("Lease renewal loop stopped");
}
