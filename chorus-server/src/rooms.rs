//! Local room hosting
//!
//! A room is bound on exactly one machine at a time: its admin script runs
//! here and a consumer task drains the room topic. Membership is kept both
//! in memory and in the room store. The machine hosting a room also holds
//! the room's ownership claim.

use crate::ownership::OwnershipService;
use crate::registry::Registry;
use chorus_shared::{
    store_call, ChorusError, ChorusResult, Command, ConnectionId, CoordinationConfig, MachineId,
    Message, NewRoom, PubSubTransport, RoomId, RoomRecord, RoomStore, ScriptContext,
    ScriptEffect, ScriptSandbox, StoreBackend, Subscription,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A room bound on this machine
#[derive(Debug)]
pub struct LocalRoom {
    record: RoomRecord,
    members: RwLock<BTreeSet<ConnectionId>>,
    cancel: CancellationToken,
}

impl LocalRoom {
    fn new(record: RoomRecord, cancel: CancellationToken) -> Self {
        Self {
            record,
            members: RwLock::new(BTreeSet::new()),
            cancel,
        }
    }

    pub fn record(&self) -> &RoomRecord {
        &self.record
    }

    pub fn room_id(&self) -> &RoomId {
        &self.record.room_id
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        self.members.read().await.iter().cloned().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub fn is_bound(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

pub type RoomRegistry = Registry<RoomId, LocalRoom>;

struct RoomServiceInner {
    machine_id: MachineId,
    rooms: Arc<dyn RoomStore>,
    transport: Arc<dyn PubSubTransport>,
    ownership: OwnershipService,
    sandbox: Arc<dyn ScriptSandbox>,
    registry: Arc<RoomRegistry>,
    config: CoordinationConfig,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct RoomService {
    inner: Arc<RoomServiceInner>,
}

impl RoomService {
    pub fn new(
        machine_id: MachineId,
        backend: &StoreBackend,
        ownership: OwnershipService,
        sandbox: Arc<dyn ScriptSandbox>,
        registry: Arc<RoomRegistry>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RoomServiceInner {
                machine_id,
                rooms: backend.rooms.clone(),
                transport: backend.transport.clone(),
                ownership,
                sandbox,
                registry,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.inner.machine_id
    }

    pub fn ownership(&self) -> &OwnershipService {
        &self.inner.ownership
    }

    /// Claim, persist and bind a room owned by this machine. The record and
    /// the claim are removed again if binding fails.
    pub async fn new_room(&self, request: NewRoom) -> ChorusResult<RoomRecord> {
        let record = RoomRecord::new(request, self.inner.machine_id.clone(), Utc::now());
        let resource = record.room_id.resource_key();
        if !self
            .inner
            .ownership
            .claim_ownership(&resource, Duration::ZERO)
            .await?
        {
            return Err(ChorusError::room_exists(record.room_id.as_str()));
        }

        let created = store_call(
            self.inner.config.store_timeout,
            "create_room",
            self.inner.rooms.create_room(&record),
        )
        .await;
        if let Err(e) = created {
            self.inner.release(&resource).await;
            return Err(e);
        }

        if let Err(e) = self.bind_room(&record).await {
            error!("Failed to bind new room {}: {}", record.room_id, e);
            let cleanup = store_call(
                self.inner.config.store_timeout,
                "delete_room",
                self.inner.rooms.delete_room(&record.room_id),
            )
            .await;
            if let Err(cleanup) = cleanup {
                warn!("Could not remove unbound room {}: {}", record.room_id, cleanup);
            }
            self.inner.release(&resource).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Start hosting `record` locally: create its script context, join its
    /// topic and probe for members with a `Ping`. Binding an already bound
    /// room is a no-op.
    pub async fn bind_room(&self, record: &RoomRecord) -> ChorusResult<()> {
        let room_id = &record.room_id;
        if self.inner.registry.contains(room_id) {
            debug!("Room {} already bound", room_id);
            return Ok(());
        }

        let script = self.inner.sandbox.bind(record).map_err(|e| match e {
            ChorusError::Binding { .. } => e,
            other => ChorusError::binding(room_id.as_str(), other.to_string()),
        })?;

        let subscription = store_call(
            self.inner.config.store_timeout,
            "subscribe",
            self.inner.transport.subscribe(&room_id.topic()),
        )
        .await?;

        let room = Arc::new(LocalRoom::new(
            record.clone(),
            self.inner.shutdown.child_token(),
        ));
        if !self.inner.registry.register_if_absent(room_id.clone(), room.clone()) {
            debug!("Room {} was bound concurrently", room_id);
            return Ok(());
        }
        tokio::spawn(consume(self.inner.clone(), room, subscription, script));

        let probe = Message::new(room_id.clone(), room_id.listener_id(), Command::Ping);
        if let Err(e) = self.inner.publish(room_id, &probe).await {
            warn!("Presence probe for {} failed: {}", room_id, e);
        }
        info!("Bound room {} ({}) on {}", room_id, record.name, self.inner.machine_id);
        Ok(())
    }

    /// Stop hosting a room locally without touching the store
    pub fn unbind_room(&self, room_id: &RoomId) -> bool {
        self.inner.unbind(room_id)
    }

    /// Unbind, drop the topic, delete the record with its membership and
    /// release the claim
    pub async fn destroy_room(&self, room_id: &RoomId) -> ChorusResult<bool> {
        self.inner.destroy(room_id).await
    }

    /// Announce that `connection_id` joins the room
    pub async fn join_room(&self, room_id: &RoomId, connection_id: &ConnectionId) -> ChorusResult<()> {
        let message = Message::new(room_id.clone(), connection_id.listener_id(), Command::Join);
        self.inner.publish(room_id, &message).await
    }

    pub async fn leave_room(&self, room_id: &RoomId, connection_id: &ConnectionId) -> ChorusResult<()> {
        let message = Message::new(room_id.clone(), connection_id.listener_id(), Command::Leave);
        self.inner.publish(room_id, &message).await
    }

    /// Route a message to whichever machine hosts `connection_id`.
    /// Returns `false` when the connection is unknown.
    pub async fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        message: Message,
    ) -> ChorusResult<bool> {
        let machine = store_call(
            self.inner.config.store_timeout,
            "find_machine_for_connection",
            self.inner.rooms.find_machine_for_connection(connection_id),
        )
        .await?;
        let Some(machine) = machine else {
            return Ok(false);
        };

        let payload = message.to(connection_id.listener_id()).encode()?;
        store_call(
            self.inner.config.store_timeout,
            "publish",
            self.inner.transport.publish(&machine.topic(), payload),
        )
        .await?;
        Ok(true)
    }

    pub fn local_room(&self, room_id: &RoomId) -> Option<Arc<LocalRoom>> {
        self.inner.registry.find(room_id)
    }

    pub fn bound_rooms(&self) -> Vec<RoomId> {
        self.inner.registry.keys()
    }

    /// Unbind every local room; records stay in the store for failover
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained = self.inner.registry.drain();
        info!("Unbound {} local rooms", drained.len());
    }
}

impl RoomServiceInner {
    fn unbind(&self, room_id: &RoomId) -> bool {
        match self.registry.unregister(room_id) {
            Some(room) => {
                room.cancel.cancel();
                debug!("Unbound room {}", room_id);
                true
            }
            None => false,
        }
    }

    async fn destroy(&self, room_id: &RoomId) -> ChorusResult<bool> {
        self.unbind(room_id);
        let topic = room_id.topic();
        let dropped = store_call(
            self.config.store_timeout,
            "delete_topic",
            self.transport.delete_topic(&topic),
        )
        .await;
        if let Err(e) = dropped {
            warn!("Could not delete topic for {}: {}", room_id, e);
        }
        let deleted = store_call(
            self.config.store_timeout,
            "delete_room",
            self.rooms.delete_room(room_id),
        )
        .await?;
        self.release(&room_id.resource_key()).await;
        if deleted {
            info!("Destroyed room {}", room_id);
        }
        Ok(deleted)
    }

    async fn release(&self, resource: &str) {
        if let Err(e) = self.ownership.release_ownership(resource).await {
            warn!("Could not release {}, it will expire: {}", resource, e);
        }
    }

    async fn publish(&self, room_id: &RoomId, message: &Message) -> ChorusResult<()> {
        let payload = message.encode()?;
        store_call(
            self.config.store_timeout,
            "publish",
            self.transport.publish(&room_id.topic(), payload),
        )
        .await
    }

    async fn handle_message(
        &self,
        room: &LocalRoom,
        script: &mut dyn ScriptContext,
        message: Message,
    ) -> Vec<ScriptEffect> {
        let room_id = room.room_id();
        if message.sender_id == room_id.listener_id() {
            return Vec::new();
        }
        if &message.room_id != room_id {
            debug!("Dropping message for {} on topic of {}", message.room_id, room_id);
            return Vec::new();
        }

        match &message.cmd {
            Command::Ping => {
                debug!("Ignoring probe from {} in {}", message.sender_id, room_id);
                Vec::new()
            }
            Command::Pong => {
                self.add_member(room, message.sender_id.to_connection_id()).await;
                Vec::new()
            }
            Command::Join => {
                self.add_member(room, message.sender_id.to_connection_id()).await;
                script.on_message(&message)
            }
            Command::Leave => {
                let now_empty = self
                    .remove_member(room, &message.sender_id.to_connection_id())
                    .await;
                let mut effects = script.on_message(&message);
                if now_empty {
                    debug!("Room {} is empty", room_id);
                    effects.extend(script.on_room_empty());
                }
                effects
            }
            Command::Room(_) => script.on_message(&message),
            Command::Error(reason) => {
                warn!("Error reported in room {} by {}: {}", room_id, message.sender_id, reason);
                Vec::new()
            }
        }
    }

    async fn add_member(&self, room: &LocalRoom, connection_id: ConnectionId) {
        let added = room.members.write().await.insert(connection_id.clone());
        if !added {
            return;
        }
        let persisted = store_call(
            self.config.store_timeout,
            "add_room_member",
            self.rooms.add_room_member(room.room_id(), &connection_id),
        )
        .await;
        if let Err(e) = persisted {
            error!("Could not persist member {} of {}: {}", connection_id, room.room_id(), e);
        }
    }

    /// Returns `true` if this removal left the room empty
    async fn remove_member(&self, room: &LocalRoom, connection_id: &ConnectionId) -> bool {
        let (removed, now_empty) = {
            let mut members = room.members.write().await;
            let removed = members.remove(connection_id);
            (removed, members.is_empty())
        };
        if !removed {
            return false;
        }
        let persisted = store_call(
            self.config.store_timeout,
            "remove_room_member",
            self.rooms.remove_room_member(room.room_id(), connection_id),
        )
        .await;
        if let Err(e) = persisted {
            error!("Could not remove member {} of {}: {}", connection_id, room.room_id(), e);
        }
        now_empty
    }

    async fn apply_effects(&self, room: &LocalRoom, effects: Vec<ScriptEffect>) {
        for effect in effects {
            match effect {
                ScriptEffect::Send(message) => {
                    if let Err(e) = self.publish(room.room_id(), &message).await {
                        warn!("Script message in {} not delivered: {}", room.room_id(), e);
                    }
                }
                ScriptEffect::EndRoom => {
                    info!("Script ended room {}", room.room_id());
                    if let Err(e) = self.destroy(room.room_id()).await {
                        error!("Could not end room {}: {}", room.room_id(), e);
                    }
                    return;
                }
            }
        }
    }
}

async fn consume(
    inner: Arc<RoomServiceInner>,
    room: Arc<LocalRoom>,
    mut subscription: Subscription,
    mut script: Box<dyn ScriptContext>,
) {
    loop {
        let payload = tokio::select! {
            _ = room.cancel.cancelled() => break,
            payload = subscription.recv() => payload,
        };
        let Some(payload) = payload else {
            debug!("Topic {} closed", subscription.topic());
            break;
        };

        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable message on {}: {}", subscription.topic(), e);
                continue;
            }
        };
        let effects = inner.handle_message(&room, script.as_mut(), message).await;
        inner.apply_effects(&room, effects).await;
    }

    // Only drop our own registration, not a later rebinding of the same id
    if let Some(current) = inner.registry.find(room.room_id()) {
        if Arc::ptr_eq(&current, &room) {
            inner.registry.unregister(room.room_id());
        }
    }
    debug!("Consumer for room {} stopped", room.room_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_shared::config::defaults::OWNERSHIP_HASH;
    use chorus_shared::{
        KeyValueStore, MembershipStore, MemoryPubSub, MemoryStore, RelaySandbox,
        END_WHEN_EMPTY_SCRIPT,
    };
    use chorus_util::TokioClock;

    struct Harness {
        store: Arc<MemoryStore>,
        bus: Arc<MemoryPubSub>,
        service: RoomService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new(Arc::new(TokioClock::new())));
        let bus = Arc::new(MemoryPubSub::new());
        let backend = StoreBackend::from_memory(store.clone(), bus.clone());
        let machine_id = MachineId::generate("RS");
        let ownership =
            OwnershipService::start(machine_id.clone(), &backend, CoordinationConfig::default());
        let service = RoomService::new(
            machine_id,
            &backend,
            ownership,
            Arc::new(RelaySandbox),
            Arc::new(RoomRegistry::new()),
            CoordinationConfig::default(),
        );
        Harness {
            store,
            bus,
            service,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_room_is_persisted_and_bound() {
        let h = harness();
        let record = h.service.new_room(NewRoom::new("chat", "relay")).await.unwrap();

        let stored = h.store.get_room(&record.room_id).await.unwrap().unwrap();
        assert_eq!(&stored.owner, h.service.machine_id());
        assert!(h.service.local_room(&record.room_id).is_some());
        assert_eq!(h.bus.subscriber_count(&record.room_id.topic()), 1);
        let owner = h
            .service
            .ownership()
            .get_owner(&record.room_id.resource_key())
            .await
            .unwrap();
        assert_eq!(owner.as_ref(), Some(h.service.machine_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_room_refused_when_claimed_elsewhere() {
        let h = harness();
        let room_id = RoomId::new("Rtaken000");
        h.store
            .hset_nx(OWNERSHIP_HASH, &room_id.resource_key(), "Machine:RS:other")
            .await
            .unwrap();
        h.store
            .create_machine(&MachineId::new("Machine:RS:other"), "RS")
            .await
            .unwrap();

        let err = h
            .service
            .new_room(NewRoom::new("chat", "relay").with_id(room_id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorusError::RoomExists { .. }));
        assert!(h.store.get_room(&room_id).await.unwrap().is_none());
        assert!(h.service.bound_rooms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_room_with_bad_script_is_rolled_back() {
        let h = harness();
        let request = NewRoom::new("broken", "").with_id(RoomId::new("Rbroken00"));

        let err = h.service.new_room(request).await.unwrap_err();
        assert!(matches!(err, ChorusError::Binding { .. }));
        assert!(h.store.get_room(&RoomId::new("Rbroken00")).await.unwrap().is_none());
        assert!(h.service.bound_rooms().is_empty());
        let claim = h
            .store
            .hget(OWNERSHIP_HASH, &RoomId::new("Rbroken00").resource_key())
            .await
            .unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_probes_and_collects_pongs() {
        let h = harness();
        let record = RoomRecord::new(NewRoom::new("chat", "relay"), h.service.machine_id().clone(), Utc::now());
        h.store.create_room(&record).await.unwrap();

        let topic = record.room_id.topic();
        let mut client_view = h.bus.subscribe(&topic).await.unwrap();
        h.service.bind_room(&record).await.unwrap();

        let probe = Message::decode(&client_view.recv().await.unwrap()).unwrap();
        assert_eq!(probe.cmd, Command::Ping);

        let conn = ConnectionId::generate();
        let pong = Message::new(record.room_id.clone(), conn.listener_id(), Command::Pong);
        h.bus.publish(&topic, pong.encode().unwrap()).await.unwrap();
        settle().await;

        let room = h.service.local_room(&record.room_id).unwrap();
        assert_eq!(room.members().await, vec![conn.clone()]);
        assert_eq!(h.store.get_room_members(&record.room_id).await.unwrap(), vec![conn]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_is_idempotent() {
        let h = harness();
        let record = h.service.new_room(NewRoom::new("chat", "relay")).await.unwrap();
        h.service.bind_room(&record).await.unwrap();

        assert_eq!(h.bus.subscriber_count(&record.room_id.topic()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_leave_and_end_when_empty() {
        let h = harness();
        let record = h
            .service
            .new_room(NewRoom::new("match", END_WHEN_EMPTY_SCRIPT))
            .await
            .unwrap();
        let conn = ConnectionId::generate();

        h.service.join_room(&record.room_id, &conn).await.unwrap();
        settle().await;
        assert_eq!(h.store.get_room_members(&record.room_id).await.unwrap().len(), 1);

        h.service.leave_room(&record.room_id, &conn).await.unwrap();
        settle().await;
        assert!(h.store.get_room(&record.room_id).await.unwrap().is_none());
        assert!(h.service.local_room(&record.room_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_command_is_relayed() {
        let h = harness();
        let record = h.service.new_room(NewRoom::new("chat", "relay")).await.unwrap();
        let mut client_view = h.bus.subscribe(&record.room_id.topic()).await.unwrap();

        let conn = ConnectionId::generate();
        let say = Message::new(record.room_id.clone(), conn.listener_id(), Command::Room("say".into()))
            .with_data("text", "hello");
        h.bus
            .publish(&record.room_id.topic(), say.encode().unwrap())
            .await
            .unwrap();

        // First our own message, then the relay from the room
        let _ = client_view.recv().await.unwrap();
        let relayed = Message::decode(&client_view.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.sender_id, record.room_id.listener_id());
        assert_eq!(relayed.data["text"], "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_room_cleans_up() {
        let h = harness();
        let record = h.service.new_room(NewRoom::new("chat", "relay")).await.unwrap();
        let conn = ConnectionId::generate();
        h.store.add_room_member(&record.room_id, &conn).await.unwrap();

        assert!(h.service.destroy_room(&record.room_id).await.unwrap());
        assert!(h.store.get_room(&record.room_id).await.unwrap().is_none());
        assert!(h.store.get_room_members(&record.room_id).await.unwrap().is_empty());
        assert_eq!(h.bus.subscriber_count(&record.room_id.topic()), 0);
        let claim = h
            .store
            .hget(OWNERSHIP_HASH, &record.room_id.resource_key())
            .await
            .unwrap();
        assert!(claim.is_none());
        assert!(h.service.ownership().lease().keys().await.is_empty());
        assert!(!h.service.destroy_room(&record.room_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_connection_routes_by_machine() {
        let h = harness();
        let front_end = MachineId::generate("FE");
        let conn = ConnectionId::generate();
        h.store.create_connection(&conn, &front_end).await.unwrap();
        let mut machine_view = h.bus.subscribe(&front_end.topic()).await.unwrap();

        let room = RoomId::new("R00000001");
        let message = Message::new(room.clone(), room.listener_id(), Command::Room("hi".into()));
        assert!(h.service.send_to_connection(&conn, message).await.unwrap());

        let delivered = Message::decode(&machine_view.recv().await.unwrap()).unwrap();
        assert_eq!(delivered.receiver_id, Some(conn.listener_id()));

        let unknown = ConnectionId::generate();
        let message = Message::new(room.clone(), room.listener_id(), Command::Ping);
        assert!(!h.service.send_to_connection(&unknown, message).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unbinds_but_keeps_records() {
        let h = harness();
        let record = h.service.new_room(NewRoom::new("chat", "relay")).await.unwrap();

        h.service.shutdown();
        settle().await;
        assert!(h.service.bound_rooms().is_empty());
        assert!(h.store.get_room(&record.room_id).await.unwrap().is_some());
    }
}
