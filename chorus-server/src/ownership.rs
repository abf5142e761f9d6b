//! Ownership Service
//!
//! Claims live in a single distributed hash (`resource -> machine id`). A claim
//! is bound to this process's lease, so it lapses on its own if the process
//! dies. A recorded owner only counts while its machine row is live.

use crate::lease::{DistributedHash, Lease};
use chorus_shared::config::defaults::OWNERSHIP_HASH;
use chorus_shared::{
    store_call, ChorusError, ChorusResult, CoordinationConfig, KeyValueStore, MachineId,
    MembershipStore, StoreBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct OwnershipInner {
    machine_id: MachineId,
    hash: String,
    kv: Arc<dyn KeyValueStore>,
    membership: Arc<dyn MembershipStore>,
    lease: Lease,
    config: CoordinationConfig,
}

#[derive(Clone)]
pub struct OwnershipService {
    inner: Arc<OwnershipInner>,
}

impl OwnershipService {
    /// Start the service for `machine_id`, with its own lease
    pub fn start(machine_id: MachineId, backend: &StoreBackend, config: CoordinationConfig) -> Self {
        Self::start_with_hash(machine_id, backend, config, OWNERSHIP_HASH)
    }

    pub fn start_with_hash(
        machine_id: MachineId,
        backend: &StoreBackend,
        config: CoordinationConfig,
        hash: &str,
    ) -> Self {
        let lease = Lease::with_store_timeout(
            config.lease_ttl,
            Arc::new(DistributedHash::new(backend.kv.clone(), hash)),
            config.store_timeout,
        );
        info!("Ownership service started for {}", machine_id);
        Self {
            inner: Arc::new(OwnershipInner {
                machine_id,
                hash: hash.to_string(),
                kv: backend.kv.clone(),
                membership: backend.membership.clone(),
                lease,
                config,
            }),
        }
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.inner.machine_id
    }

    pub fn lease(&self) -> &Lease {
        &self.inner.lease
    }

    /// Try to become the owner of `resource`, polling until `wait` elapses.
    ///
    /// A claim held by a machine that is no longer live is cleared and taken
    /// over. Returns `true` if this machine owns the resource on return.
    pub async fn claim_ownership(&self, resource: &str, wait: Duration) -> ChorusResult<bool> {
        if !self.inner.lease.is_active() {
            return Err(ChorusError::internal("ownership service is stopped"));
        }

        let deadline = Instant::now() + wait;
        loop {
            match self.try_claim(resource).await {
                Ok(true) => {
                    if let Err(e) = self.inner.lease.add_key(resource).await {
                        warn!("Claimed {} but could not bind it to the lease: {}", resource, e);
                    }
                    debug!("Claimed ownership of {}", resource);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!("Claim attempt for {} failed: {}", resource, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Gave up claiming {} after {:?}", resource, wait);
                return Ok(false);
            }
            tokio::time::sleep(self.inner.config.claim_poll_interval.min(deadline - now)).await;
        }
    }

    async fn try_claim(&self, resource: &str) -> ChorusResult<bool> {
        let me = self.inner.machine_id.as_str();
        if self.hset_nx(resource).await? {
            return Ok(true);
        }

        let Some(owner) = self.hget(resource).await? else {
            // Released between the two calls
            return self.hset_nx(resource).await;
        };
        if owner == me {
            return Ok(true);
        }

        let owner = MachineId::new(owner);
        if self.is_live(&owner).await? {
            return Ok(false);
        }

        let cleared = store_call(
            self.inner.config.store_timeout,
            "hdel_if_eq",
            self.inner.kv.hdel_if_eq(&self.inner.hash, resource, owner.as_str()),
        )
        .await?;
        if cleared {
            info!("Cleared stale claim on {} held by {}", resource, owner);
        }
        self.hset_nx(resource).await
    }

    /// Claim `resource` after `previous` has been declared offline. Its claim
    /// is cleared without waiting for its heartbeat to go stale.
    pub async fn take_over_ownership(
        &self,
        resource: &str,
        previous: &MachineId,
        wait: Duration,
    ) -> ChorusResult<bool> {
        if previous != &self.inner.machine_id {
            let cleared = store_call(
                self.inner.config.store_timeout,
                "hdel_if_eq",
                self.inner.kv.hdel_if_eq(&self.inner.hash, resource, previous.as_str()),
            )
            .await?;
            if cleared {
                info!("Took over claim on {} from offline {}", resource, previous);
            }
        }
        self.claim_ownership(resource, wait).await
    }

    /// Drop this machine's claim on `resource`. Claims held by others are left
    /// untouched; releasing something not held is a no-op.
    pub async fn release_ownership(&self, resource: &str) -> ChorusResult<bool> {
        self.inner.lease.remove_key(resource).await;
        let released = store_call(
            self.inner.config.store_timeout,
            "hdel_if_eq",
            self.inner
                .kv
                .hdel_if_eq(&self.inner.hash, resource, self.inner.machine_id.as_str()),
        )
        .await?;
        if released {
            debug!("Released ownership of {}", resource);
        }
        Ok(released)
    }

    /// Raw lookup, no liveness check
    pub async fn get_owner(&self, resource: &str) -> ChorusResult<Option<MachineId>> {
        Ok(self.hget(resource).await?.map(MachineId::new))
    }

    /// The recorded owner, only if its machine is live
    pub async fn get_valid_owner(&self, resource: &str) -> ChorusResult<Option<MachineId>> {
        match self.get_owner(resource).await? {
            Some(owner) if self.is_live(&owner).await? => Ok(Some(owner)),
            _ => Ok(None),
        }
    }

    pub async fn is_owned_by_me(&self, resource: &str) -> ChorusResult<bool> {
        Ok(self
            .get_valid_owner(resource)
            .await?
            .is_some_and(|owner| owner == self.inner.machine_id))
    }

    /// Delete every claim this machine holds and stop renewing
    pub async fn stop(&self) -> ChorusResult<()> {
        info!("Stopping ownership service for {}", self.inner.machine_id);
        self.inner.lease.destroy().await
    }

    /// Stop renewing and let the claims expire
    pub async fn abandon(&self) {
        self.inner.lease.abandon().await;
    }

    async fn hset_nx(&self, resource: &str) -> ChorusResult<bool> {
        store_call(
            self.inner.config.store_timeout,
            "hset_nx",
            self.inner
                .kv
                .hset_nx(&self.inner.hash, resource, self.inner.machine_id.as_str()),
        )
        .await
    }

    async fn hget(&self, resource: &str) -> ChorusResult<Option<String>> {
        store_call(
            self.inner.config.store_timeout,
            "hget",
            self.inner.kv.hget(&self.inner.hash, resource),
        )
        .await
    }

    async fn is_live(&self, machine_id: &MachineId) -> ChorusResult<bool> {
        store_call(
            self.inner.config.store_timeout,
            "is_machine_live",
            self.inner
                .membership
                .is_machine_live(machine_id, self.inner.config.staleness_threshold),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_shared::{MemoryPubSub, MemoryStore};
    use chorus_util::TokioClock;

    struct Fleet {
        store: Arc<MemoryStore>,
        backend: StoreBackend,
    }

    impl Fleet {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new(Arc::new(TokioClock::new())));
            let backend = StoreBackend::from_memory(store.clone(), Arc::new(MemoryPubSub::new()));
            Self { store, backend }
        }

        async fn machine(&self) -> OwnershipService {
            let id = MachineId::generate("RS");
            self.store.create_machine(&id, "RS").await.unwrap();
            OwnershipService::start(id, &self.backend, CoordinationConfig::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_and_get_owner() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;

        assert!(a.claim_ownership("rooms/1", Duration::ZERO).await.unwrap());
        assert_eq!(a.get_owner("rooms/1").await.unwrap(), Some(a.machine_id().clone()));
        assert!(a.is_owned_by_me("rooms/1").await.unwrap());
        assert_eq!(a.lease().keys().await, vec!["rooms/1".to_string()]);

        // Re-claiming an owned resource succeeds immediately
        assert!(a.claim_ownership("rooms/1", Duration::ZERO).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_claim_times_out() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        let b = fleet.machine().await;

        assert!(a.claim_ownership("rooms/2", Duration::ZERO).await.unwrap());

        let start = Instant::now();
        assert!(!b.claim_ownership("rooms/2", Duration::from_secs(5)).await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_claim_succeeds_after_release() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        let b = fleet.machine().await;
        assert!(a.claim_ownership("rooms/3", Duration::ZERO).await.unwrap());

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.claim_ownership("rooms/3", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(a.release_ownership("rooms/3").await.unwrap());

        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(b.get_owner("rooms/3").await.unwrap(), Some(b.machine_id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_owner_is_reclaimed() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        let b = fleet.machine().await;
        assert!(a.claim_ownership("rooms/4", Duration::ZERO).await.unwrap());

        // Keep B alive while A stops heartbeating
        tokio::time::advance(Duration::from_secs(6)).await;
        fleet.store.touch_machine(b.machine_id()).await.unwrap();

        assert_eq!(b.get_valid_owner("rooms/4").await.unwrap(), None);
        assert!(b.claim_ownership("rooms/4", Duration::ZERO).await.unwrap());
        assert_eq!(b.get_owner("rooms/4").await.unwrap(), Some(b.machine_id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_over_from_offline_machine() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        let b = fleet.machine().await;
        let c = fleet.machine().await;
        assert!(a.claim_ownership("rooms/10", Duration::ZERO).await.unwrap());

        // A still heartbeats, but has been reported offline
        assert!(!b.claim_ownership("rooms/10", Duration::ZERO).await.unwrap());
        assert!(b
            .take_over_ownership("rooms/10", a.machine_id(), Duration::ZERO)
            .await
            .unwrap());
        assert_eq!(b.get_valid_owner("rooms/10").await.unwrap(), Some(b.machine_id().clone()));

        // Naming the wrong previous holder leaves a live claim alone
        assert!(!c
            .take_over_ownership("rooms/10", a.machine_id(), Duration::ZERO)
            .await
            .unwrap());
        assert_eq!(c.get_owner("rooms/10").await.unwrap(), Some(b.machine_id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_conditional_and_idempotent() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        let b = fleet.machine().await;
        assert!(a.claim_ownership("rooms/5", Duration::ZERO).await.unwrap());

        assert!(!b.release_ownership("rooms/5").await.unwrap());
        assert!(a.release_ownership("rooms/5").await.unwrap());
        assert!(!a.release_ownership("rooms/5").await.unwrap());
        assert!(a.lease().keys().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_deletes_claims() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;
        a.claim_ownership("rooms/6", Duration::ZERO).await.unwrap();
        a.claim_ownership("rooms/7", Duration::ZERO).await.unwrap();

        a.stop().await.unwrap();
        assert!(fleet.store.hkeys(OWNERSHIP_HASH).await.unwrap().is_empty());
        assert!(a.claim_ownership("rooms/8", Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_survives_store_outage() {
        let fleet = Fleet::new();
        let a = fleet.machine().await;

        fleet.store.set_offline(true);
        let claim = {
            let a = a.clone();
            tokio::spawn(async move { a.claim_ownership("rooms/9", Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        fleet.store.set_offline(false);

        assert!(claim.await.unwrap().unwrap());
    }
}
