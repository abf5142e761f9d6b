//! Process wiring: election, ownership, rooms and failover for one machine

use crate::config::{BackendConfig, ChorusServerConfig};
use crate::election::{LeaderElection, LeadershipState};
use crate::failover::RoomFailover;
use crate::ownership::OwnershipService;
use crate::rooms::{RoomRegistry, RoomService};
use chorus_server_redis::{RedisBackend, RedisConfig};
use chorus_shared::{
    store_call, ChorusResult, CoordinationConfig, MachineId, NewRoom, RelaySandbox, RoomId,
    ScriptSandbox, StoreBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct ChorusServerBuilder {
    config: ChorusServerConfig,
    backend: Option<StoreBackend>,
    sandbox: Arc<dyn ScriptSandbox>,
    registry: Option<Arc<RoomRegistry>>,
}

impl ChorusServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ChorusServerConfig::default(),
            backend: None,
            sandbox: Arc::new(RelaySandbox),
            registry: None,
        }
    }

    pub fn with_config(mut self, config: ChorusServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_machine_type<S: Into<String>>(mut self, machine_type: S) -> Self {
        self.config.server.machine_type = machine_type.into();
        self
    }

    pub fn with_machine_id(mut self, machine_id: MachineId) -> Self {
        self.config.server.machine_id = Some(machine_id.into_inner());
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.config.coordination = coordination;
        self
    }

    /// Use an existing backend instead of building one from the config
    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_registry(mut self, registry: Arc<RoomRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_lobby(mut self, enabled: bool) -> Self {
        self.config.lobby.enabled = enabled;
        self
    }

    /// Register the machine, join the election and bootstrap the lobby
    pub async fn start(self) -> ChorusResult<ChorusServer> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => connect_backend(&self.config.backend).await?,
        };
        ChorusServer::start(
            self.config,
            backend,
            self.sandbox,
            self.registry.unwrap_or_default(),
        )
        .await
    }
}

impl Default for ChorusServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect_backend(config: &BackendConfig) -> ChorusResult<StoreBackend> {
    match config {
        BackendConfig::Memory => {
            warn!("Using in-memory backend; state is not shared with other processes");
            Ok(StoreBackend::memory())
        }
        BackendConfig::Redis { url, key_prefix } => {
            let redis = RedisConfig::builder()
                .url(url.clone())
                .key_prefix(key_prefix.clone())
                .build();
            RedisBackend::connect(redis).await
        }
    }
}

/// Snapshot of a running server
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub machine_id: MachineId,
    pub machine_type: String,
    pub leadership: LeadershipState,
    pub bound_rooms: usize,
    pub leased_keys: usize,
}

/// One coordinated machine
pub struct ChorusServer {
    config: ChorusServerConfig,
    machine_id: MachineId,
    backend: StoreBackend,
    election: LeaderElection,
    ownership: OwnershipService,
    rooms: RoomService,
    failover: Arc<RoomFailover>,
}

impl ChorusServer {
    pub fn builder() -> ChorusServerBuilder {
        ChorusServerBuilder::new()
    }

    async fn start(
        config: ChorusServerConfig,
        backend: StoreBackend,
        sandbox: Arc<dyn ScriptSandbox>,
        registry: Arc<RoomRegistry>,
    ) -> ChorusResult<Self> {
        let machine_type = config.server.machine_type.clone();
        let machine_id = match &config.server.machine_id {
            Some(id) => MachineId::new(id.clone()),
            None => MachineId::generate(&machine_type),
        };
        let coordination = config.coordination.clone();

        let ownership =
            OwnershipService::start(machine_id.clone(), &backend, coordination.clone());
        let rooms = RoomService::new(
            machine_id.clone(),
            &backend,
            ownership.clone(),
            sandbox,
            registry,
            coordination.clone(),
        );
        let failover = Arc::new(RoomFailover::new(rooms.clone(), &backend, coordination.clone()));

        let election = LeaderElection::start(
            machine_id.clone(),
            &machine_type,
            backend.membership.clone(),
            failover.clone(),
            coordination,
        )
        .await?;

        let server = Self {
            config,
            machine_id,
            backend,
            election,
            ownership,
            rooms,
            failover,
        };
        info!("🚀 Machine {} started as {}", server.machine_id, machine_type);

        if server.config.lobby.enabled {
            if let Err(e) = server.bootstrap_lobby().await {
                error!("Lobby bootstrap failed: {}", e);
            }
        }
        Ok(server)
    }

    /// Create the lobby room unless a live machine already holds it
    pub async fn bootstrap_lobby(&self) -> ChorusResult<bool> {
        let lobby = &self.config.lobby;
        let room_id = RoomId::new(lobby.room_id.clone());
        let resource = room_id.resource_key();

        if !self
            .ownership
            .claim_ownership(&resource, lobby.claim_wait)
            .await?
        {
            info!("Lobby {} is hosted by another machine", room_id);
            return Ok(false);
        }

        let existing = store_call(
            self.config.coordination.store_timeout,
            "get_room",
            self.backend.rooms.get_room(&room_id),
        )
        .await?;
        match existing {
            None => {
                let request = NewRoom::new(lobby.name.clone(), lobby.script.clone())
                    .with_id(room_id.clone())
                    .destroy_on_orphan(false);
                self.rooms.new_room(request).await?;
                info!("🏠 Created lobby {}", room_id);
                Ok(true)
            }
            Some(record) if record.owner == self.machine_id => {
                self.rooms.bind_room(&record).await?;
                Ok(true)
            }
            Some(record) => {
                // The recorded owner, or failover once it is gone, holds the claim
                if let Err(e) = self.ownership.release_ownership(&resource).await {
                    warn!("Could not release lobby claim {}: {}", resource, e);
                }
                info!(
                    "Lobby {} already recorded under {}; leaving it to failover",
                    room_id, record.owner
                );
                Ok(false)
            }
        }
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    pub fn config(&self) -> &ChorusServerConfig {
        &self.config
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    pub fn ownership(&self) -> &OwnershipService {
        &self.ownership
    }

    pub fn rooms(&self) -> &RoomService {
        &self.rooms
    }

    pub fn failover(&self) -> &Arc<RoomFailover> {
        &self.failover
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Wait until this machine leads or `limit` passes
    pub async fn wait_for_leadership(&self, limit: Duration) -> bool {
        let mut state = self.election.subscribe_state();
        tokio::time::timeout(limit, state.wait_for(|s| *s == LeadershipState::Leader))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            machine_id: self.machine_id.clone(),
            machine_type: self.election.machine_type().to_string(),
            leadership: self.election.state(),
            bound_rooms: self.rooms.bound_rooms().len(),
            leased_keys: self.ownership.lease().keys().await.len(),
        }
    }

    /// Unbind local rooms, drop ownership claims, then leave the membership table
    pub async fn shutdown(&self) -> ChorusResult<()> {
        info!("Shutting down machine {}", self.machine_id);
        self.rooms.shutdown();
        if let Err(e) = self.ownership.stop().await {
            warn!("Ownership claims not released, they will expire: {}", e);
        }
        self.election.destroy().await?;
        info!("👋 Machine {} shut down", self.machine_id);
        Ok(())
    }

    /// Stop every loop without cleaning up, as if the process had died
    pub async fn abandon(&self) {
        self.rooms.shutdown();
        self.ownership.abandon().await;
        self.election.abandon().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_shared::{KeyValueStore, MembershipStore, MemoryPubSub, MemoryStore, RoomRecord};
    use chorus_util::TokioClock;
    use chrono::Utc;

    fn shared_backend() -> StoreBackend {
        let store = Arc::new(MemoryStore::new(Arc::new(TokioClock::new())));
        StoreBackend::from_memory(store, Arc::new(MemoryPubSub::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_starts_with_lobby() {
        let backend = shared_backend();
        let server = ChorusServer::builder()
            .with_backend(backend.clone())
            .start()
            .await
            .unwrap();

        assert!(server.wait_for_leadership(Duration::from_secs(1)).await);
        let lobby = backend.rooms.get_room(&RoomId::new("GlobalLobby")).await.unwrap().unwrap();
        assert_eq!(&lobby.owner, server.machine_id());
        assert!(!lobby.destroy_on_orphan);
        let claim = server
            .ownership()
            .get_valid_owner(&lobby.room_id.resource_key())
            .await
            .unwrap();
        assert_eq!(claim.as_ref(), Some(server.machine_id()));

        let stats = server.stats().await;
        assert_eq!(stats.bound_rooms, 1);
        assert_eq!(stats.leased_keys, 1);
        assert_eq!(stats.leadership, LeadershipState::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_server_leaves_lobby_alone() {
        let backend = shared_backend();
        let first = ChorusServer::builder()
            .with_backend(backend.clone())
            .start()
            .await
            .unwrap();
        let second = ChorusServer::builder()
            .with_backend(backend.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(first.rooms().bound_rooms().len(), 1);
        assert!(second.rooms().bound_rooms().is_empty());
        assert!(!second.bootstrap_lobby().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lobby_recorded_elsewhere_is_not_claimed() {
        let backend = shared_backend();
        let lobby = RoomId::new("GlobalLobby");
        let ghost = MachineId::generate("RS");
        let request = NewRoom::new("Lobby", "relay")
            .with_id(lobby.clone())
            .destroy_on_orphan(false);
        backend
            .rooms
            .create_room(&RoomRecord::new(request, ghost, Utc::now()))
            .await
            .unwrap();

        let server = ChorusServer::builder()
            .with_backend(backend.clone())
            .start()
            .await
            .unwrap();

        assert!(server.rooms().local_room(&lobby).is_none());
        assert!(backend
            .kv
            .hget("ownership", &lobby.resource_key())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_machine_id() {
        let id = MachineId::new("Machine:RS:fixed");
        let server = ChorusServer::builder()
            .with_backend(shared_backend())
            .with_machine_id(id.clone())
            .with_lobby(false)
            .start()
            .await
            .unwrap();
        assert_eq!(server.machine_id(), &id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let result = ChorusServer::builder()
            .with_backend(shared_backend())
            .with_machine_type("")
            .start()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cleans_up() {
        let backend = shared_backend();
        let server = ChorusServer::builder()
            .with_backend(backend.clone())
            .start()
            .await
            .unwrap();

        server.shutdown().await.unwrap();
        assert!(backend
            .membership
            .get_machine(server.machine_id())
            .await
            .unwrap()
            .is_none());
        assert!(backend.kv.hkeys("ownership").await.unwrap().is_empty());
        // The lobby record outlives its host and is picked up by failover
        assert!(backend.rooms.get_room(&RoomId::new("GlobalLobby")).await.unwrap().is_some());
    }
}
