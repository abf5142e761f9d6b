//! In-process store implementing every store trait
//!
//! State lives behind a single `RwLock`, so every trait method is atomic with
//! respect to the others. Field expiry is evaluated lazily against the
//! injected clock.

use crate::exception::{ChorusError, ChorusResult};
use crate::ids::{ConnectionId, MachineId, RoomId};
use crate::machine::{Connection, Machine};
use crate::room::RoomRecord;
use crate::store::{KeyValueStore, MembershipEvent, MembershipStore, RoomStore};
use async_trait::async_trait;
use chorus_util::{Clock, TimeUtils};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct HashField {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl HashField {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    machines: HashMap<MachineId, Machine>,
    rooms: HashMap<RoomId, RoomRecord>,
    members: HashMap<RoomId, BTreeSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
    hashes: HashMap<String, HashMap<String, HashField>>,
}

impl MemoryState {
    fn live_field(&mut self, hash: &str, field: &str, now: DateTime<Utc>) -> Option<&HashField> {
        let fields = self.hashes.get_mut(hash)?;
        if fields.get(field).is_some_and(|f| !f.is_live(now)) {
            fields.remove(field);
        }
        fields.get(field)
    }

    fn is_machine_live(&self, machine_id: &MachineId, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.machines
            .get(machine_id)
            .is_some_and(|m| !m.is_stale(now, threshold))
    }
}

/// Shared in-memory membership, room and hash store
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MembershipEvent>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
            events,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every call fail with a store error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Overwrite a machine's heartbeat, e.g. to age it in a test
    pub async fn set_machine_last_updated(
        &self,
        machine_id: &MachineId,
        last_updated: DateTime<Utc>,
    ) -> ChorusResult<()> {
        let mut state = self.state.write().await;
        let machine = state
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| ChorusError::machine_not_found(machine_id.as_str()))?;
        machine.last_updated = last_updated;
        Ok(())
    }

    fn check_online(&self) -> ChorusResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ChorusError::store("memory store is offline"))
        } else {
            Ok(())
        }
    }

    fn notify(&self, event: MembershipEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn create_machine(
        &self,
        machine_id: &MachineId,
        machine_type: &str,
    ) -> ChorusResult<Machine> {
        self.check_online()?;
        let machine = {
            let mut state = self.state.write().await;
            if state.machines.contains_key(machine_id) {
                return Err(ChorusError::machine_exists(machine_id.as_str()));
            }
            let machine = Machine::new(machine_id.clone(), machine_type, self.clock.now());
            state.machines.insert(machine_id.clone(), machine.clone());
            machine
        };
        debug!("Created machine {}", machine_id);
        self.notify(MembershipEvent::MachineCreated {
            machine_id: machine_id.clone(),
            machine_type: machine_type.to_string(),
        });
        Ok(machine)
    }

    async fn touch_machine(&self, machine_id: &MachineId) -> ChorusResult<()> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.machines.get_mut(machine_id) {
            Some(machine) => {
                machine.last_updated = now;
                Ok(())
            }
            None => Err(ChorusError::machine_not_found(machine_id.as_str())),
        }
    }

    async fn delete_machine(&self, machine_id: &MachineId) -> ChorusResult<bool> {
        self.check_online()?;
        let removed = self.state.write().await.machines.remove(machine_id);
        match removed {
            Some(machine) => {
                debug!("Deleted machine {}", machine_id);
                self.notify(MembershipEvent::MachineDeleted {
                    machine_id: machine.id,
                    machine_type: machine.machine_type,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_machine(&self, machine_id: &MachineId) -> ChorusResult<Option<Machine>> {
        self.check_online()?;
        Ok(self.state.read().await.machines.get(machine_id).cloned())
    }

    async fn get_machines_by_type(&self, machine_type: &str) -> ChorusResult<Vec<Machine>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut machines: Vec<Machine> = state
            .machines
            .values()
            .filter(|m| m.machine_type == machine_type)
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(machines)
    }

    async fn get_expired_machines(
        &self,
        machine_type: &str,
        threshold: Duration,
    ) -> ChorusResult<Vec<Machine>> {
        let now = self.clock.now();
        let machines = self.get_machines_by_type(machine_type).await?;
        Ok(machines
            .into_iter()
            .filter(|m| m.is_stale(now, threshold))
            .collect())
    }

    async fn is_machine_live(
        &self,
        machine_id: &MachineId,
        threshold: Duration,
    ) -> ChorusResult<bool> {
        self.check_online()?;
        let now = self.clock.now();
        Ok(self
            .state
            .read()
            .await
            .is_machine_live(machine_id, now, threshold))
    }

    async fn get_leader_for_type(&self, machine_type: &str) -> ChorusResult<Option<Machine>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .machines
            .values()
            .find(|m| m.machine_type == machine_type && m.leader)
            .cloned())
    }

    async fn try_set_leader(
        &self,
        machine_id: &MachineId,
        machine_type: &str,
    ) -> ChorusResult<bool> {
        self.check_online()?;
        {
            let mut state = self.state.write().await;
            let vacant = !state
                .machines
                .values()
                .any(|m| m.machine_type == machine_type && m.leader);
            if !vacant {
                return Ok(false);
            }
            match state.machines.get_mut(machine_id) {
                Some(machine) if machine.machine_type == machine_type => machine.leader = true,
                _ => return Ok(false),
            }
        }
        self.notify(MembershipEvent::LeaderChanged {
            machine_type: machine_type.to_string(),
            machine_id: machine_id.clone(),
        });
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(&self, room: &RoomRecord) -> ChorusResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if state.rooms.contains_key(&room.room_id) {
            return Err(ChorusError::room_exists(room.room_id.as_str()));
        }
        state.rooms.insert(room.room_id.clone(), room.clone());
        state.members.insert(room.room_id.clone(), BTreeSet::new());
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> ChorusResult<Option<RoomRecord>> {
        self.check_online()?;
        Ok(self.state.read().await.rooms.get(room_id).cloned())
    }

    async fn delete_room(&self, room_id: &RoomId) -> ChorusResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        state.members.remove(room_id);
        Ok(state.rooms.remove(room_id).is_some())
    }

    async fn get_rooms_by_machine(&self, machine_id: &MachineId) -> ChorusResult<Vec<RoomRecord>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut rooms: Vec<RoomRecord> = state
            .rooms
            .values()
            .filter(|r| &r.owner == machine_id)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    async fn get_orphaned_rooms(&self, threshold: Duration) -> ChorusResult<Vec<RoomRecord>> {
        self.check_online()?;
        let now = self.clock.now();
        let state = self.state.read().await;
        let mut rooms: Vec<RoomRecord> = state
            .rooms
            .values()
            .filter(|r| !state.is_machine_live(&r.owner, now, threshold))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    async fn set_room_owner(
        &self,
        room_id: &RoomId,
        old_owner: &MachineId,
        new_owner: &MachineId,
    ) -> ChorusResult<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.rooms.get_mut(room_id) {
            Some(room) if &room.owner == old_owner => {
                room.owner = new_owner.clone();
                room.last_updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_room_members(&self, room_id: &RoomId) -> ChorusResult<Vec<ConnectionId>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .members
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(room_id) {
            return Err(ChorusError::room_not_found(room_id.as_str()));
        }
        Ok(state
            .members
            .entry(room_id.clone())
            .or_default()
            .insert(connection_id.clone()))
    }

    async fn remove_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        Ok(state
            .members
            .get_mut(room_id)
            .is_some_and(|m| m.remove(connection_id)))
    }

    async fn clear_room_members(&self, room_id: &RoomId) -> ChorusResult<()> {
        self.check_online()?;
        if let Some(members) = self.state.write().await.members.get_mut(room_id) {
            members.clear();
        }
        Ok(())
    }

    async fn create_connection(
        &self,
        connection_id: &ConnectionId,
        machine_id: &MachineId,
    ) -> ChorusResult<Connection> {
        self.check_online()?;
        let connection = Connection::new(connection_id.clone(), machine_id.clone(), self.clock.now());
        self.state
            .write()
            .await
            .connections
            .insert(connection_id.clone(), connection.clone());
        Ok(connection)
    }

    async fn touch_connection(&self, connection_id: &ConnectionId) -> ChorusResult<()> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(connection_id) {
            connection.last_updated = now;
        }
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &ConnectionId) -> ChorusResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        for members in state.members.values_mut() {
            members.remove(connection_id);
        }
        Ok(state.connections.remove(connection_id).is_some())
    }

    async fn find_machine_for_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> ChorusResult<Option<MachineId>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .connections
            .get(connection_id)
            .map(|c| c.machine_id.clone()))
    }

    async fn get_expired_connections(&self, threshold: Duration) -> ChorusResult<Vec<Connection>> {
        self.check_online()?;
        let now = self.clock.now();
        let state = self.state.read().await;
        Ok(state
            .connections
            .values()
            .filter(|c| c.is_stale(now, threshold))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> ChorusResult<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if state.live_field(hash, field, now).is_some() {
            return Ok(false);
        }
        state.hashes.entry(hash.to_string()).or_default().insert(
            field.to_string(),
            HashField {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn hget(&self, hash: &str, field: &str) -> ChorusResult<Option<String>> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        Ok(state.live_field(hash, field, now).map(|f| f.value.clone()))
    }

    async fn hdel(&self, hash: &str, fields: &[String]) -> ChorusResult<u64> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let Some(entries) = state.hashes.get_mut(hash) else {
            return Ok(0);
        };
        let removed = fields
            .iter()
            .filter_map(|field| entries.remove(field))
            .filter(|f| f.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn hdel_if_eq(&self, hash: &str, field: &str, expected: &str) -> ChorusResult<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let matches = state
            .live_field(hash, field, now)
            .is_some_and(|f| f.value == expected);
        if matches {
            if let Some(entries) = state.hashes.get_mut(hash) {
                entries.remove(field);
            }
        }
        Ok(matches)
    }

    async fn hexpire(&self, hash: &str, fields: &[String], ttl: Duration) -> ChorusResult<()> {
        self.check_online()?;
        let now = self.clock.now();
        let expires_at = now + TimeUtils::to_chrono(ttl);
        let mut state = self.state.write().await;
        for field in fields {
            if state.live_field(hash, field, now).is_none() {
                continue;
            }
            if let Some(entry) = state.hashes.get_mut(hash).and_then(|h| h.get_mut(field)) {
                entry.expires_at = Some(expires_at);
            }
        }
        Ok(())
    }

    async fn hkeys(&self, hash: &str) -> ChorusResult<Vec<String>> {
        self.check_online()?;
        let now = self.clock.now();
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .hashes
            .get(hash)
            .map(|h| {
                h.iter()
                    .filter(|(_, f)| f.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::NewRoom;
    use chorus_util::TokioClock;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(TokioClock::new()))
    }

    #[tokio::test]
    async fn test_create_machine_rejects_duplicate() {
        let store = store();
        let id = MachineId::generate("RS");

        store.create_machine(&id, "RS").await.unwrap();
        let err = store.create_machine(&id, "RS").await.unwrap_err();
        assert!(matches!(err, ChorusError::MachineExists { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_machines_follow_clock() {
        let store = store();
        let old = MachineId::generate("RS");
        let fresh = MachineId::generate("RS");
        store.create_machine(&old, "RS").await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        store.create_machine(&fresh, "RS").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = store
            .get_expired_machines("RS", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old);
        assert!(!store.is_machine_live(&old, Duration::from_secs(5)).await.unwrap());
        assert!(store.is_machine_live(&fresh, Duration::from_secs(5)).await.unwrap());

        store.touch_machine(&old).await.unwrap();
        assert!(store.is_machine_live(&old, Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_set_leader_single_winner() {
        let store = store();
        let a = MachineId::generate("RS");
        let b = MachineId::generate("RS");
        let other_type = MachineId::generate("FE");
        store.create_machine(&a, "RS").await.unwrap();
        store.create_machine(&b, "RS").await.unwrap();
        store.create_machine(&other_type, "FE").await.unwrap();

        assert!(store.try_set_leader(&a, "RS").await.unwrap());
        assert!(!store.try_set_leader(&b, "RS").await.unwrap());
        assert!(store.try_set_leader(&other_type, "FE").await.unwrap());

        let leader = store.get_leader_for_type("RS").await.unwrap().unwrap();
        assert_eq!(leader.id, a);

        // Deleting the leader row vacates the slot
        assert!(store.delete_machine(&a).await.unwrap());
        assert!(store.try_set_leader(&b, "RS").await.unwrap());
    }

    #[tokio::test]
    async fn test_try_set_leader_requires_row() {
        let store = store();
        let ghost = MachineId::generate("RS");
        assert!(!store.try_set_leader(&ghost, "RS").await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_events() {
        let store = store();
        let mut events = store.subscribe();
        let id = MachineId::generate("RS");

        store.create_machine(&id, "RS").await.unwrap();
        store.try_set_leader(&id, "RS").await.unwrap();
        store.delete_machine(&id).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::MachineCreated { .. }));
        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::LeaderChanged { .. }));
        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::MachineDeleted { .. }));
    }

    #[tokio::test]
    async fn test_conditional_room_owner() {
        let store = store();
        let dead = MachineId::generate("RS");
        let a = MachineId::generate("RS");
        let b = MachineId::generate("RS");
        let room = RoomRecord::new(NewRoom::new("x", "relay"), dead.clone(), Utc::now());
        store.create_room(&room).await.unwrap();

        assert!(store.set_room_owner(&room.room_id, &dead, &a).await.unwrap());
        assert!(!store.set_room_owner(&room.room_id, &dead, &b).await.unwrap());

        let stored = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(stored.owner, a);
    }

    #[tokio::test]
    async fn test_orphaned_rooms() {
        let store = store();
        let live = MachineId::generate("RS");
        store.create_machine(&live, "RS").await.unwrap();

        let owned = RoomRecord::new(NewRoom::new("owned", "relay"), live.clone(), Utc::now());
        let orphan = RoomRecord::new(
            NewRoom::new("orphan", "relay"),
            MachineId::generate("RS"),
            Utc::now(),
        );
        store.create_room(&owned).await.unwrap();
        store.create_room(&orphan).await.unwrap();

        let orphans = store.get_orphaned_rooms(Duration::from_secs(5)).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].room_id, orphan.room_id);
    }

    #[tokio::test]
    async fn test_membership_cascades() {
        let store = store();
        let machine = MachineId::generate("FE");
        let room = RoomRecord::new(NewRoom::new("x", "relay"), machine.clone(), Utc::now());
        let conn = ConnectionId::generate();
        store.create_room(&room).await.unwrap();
        store.create_connection(&conn, &machine).await.unwrap();

        assert!(store.add_room_member(&room.room_id, &conn).await.unwrap());
        assert!(!store.add_room_member(&room.room_id, &conn).await.unwrap());
        assert_eq!(
            store.find_machine_for_connection(&conn).await.unwrap(),
            Some(machine)
        );

        store.delete_connection(&conn).await.unwrap();
        assert!(store.get_room_members(&room.room_id).await.unwrap().is_empty());

        let missing = RoomId::new("Rmissing0");
        let err = store.add_room_member(&missing, &conn).await.unwrap_err();
        assert!(matches!(err, ChorusError::RoomNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_field_expiry() {
        let store = store();
        assert!(store.hset_nx("ownership", "rooms/1", "A").await.unwrap());
        assert!(!store.hset_nx("ownership", "rooms/1", "B").await.unwrap());

        store
            .hexpire("ownership", &["rooms/1".to_string()], Duration::from_secs(15))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(
            store.hget("ownership", "rooms/1").await.unwrap().as_deref(),
            Some("A")
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.hget("ownership", "rooms/1").await.unwrap(), None);
        assert!(store.hkeys("ownership").await.unwrap().is_empty());
        assert!(store.hset_nx("ownership", "rooms/1", "B").await.unwrap());
    }

    #[tokio::test]
    async fn test_hdel_if_eq() {
        let store = store();
        store.hset_nx("ownership", "rooms/1", "A").await.unwrap();

        assert!(!store.hdel_if_eq("ownership", "rooms/1", "B").await.unwrap());
        assert!(store.hdel_if_eq("ownership", "rooms/1", "A").await.unwrap());
        assert_eq!(
            store
                .hdel("ownership", &["rooms/1".to_string()])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_offline_switch() {
        let store = store();
        store.set_offline(true);
        let err = store.get_machines_by_type("RS").await.unwrap_err();
        assert!(err.is_transient());

        store.set_offline(false);
        assert!(store.get_machines_by_type("RS").await.unwrap().is_empty());
    }
}
