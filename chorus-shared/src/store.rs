//! Collaborator interfaces the coordination core runs against
//!
//! Any backing store works as long as it provides atomic insert-if-absent,
//! conditional update and delete on single records, plus a change
//! notification that may be push based or never fire at all.

use crate::exception::{ChorusError, ChorusResult};
use crate::ids::{ConnectionId, MachineId, RoomId};
use crate::machine::{Connection, Machine};
use crate::memory::MemoryStore;
use crate::room::RoomRecord;
use crate::transport::{MemoryPubSub, PubSubTransport};
use async_trait::async_trait;
use chorus_util::{Clock, SystemClock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Change notification emitted by a membership store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    MachineCreated {
        machine_id: MachineId,
        machine_type: String,
    },
    MachineDeleted {
        machine_id: MachineId,
        machine_type: String,
    },
    LeaderChanged {
        machine_type: String,
        machine_id: MachineId,
    },
}

impl MembershipEvent {
    pub fn machine_type(&self) -> &str {
        match self {
            MembershipEvent::MachineCreated { machine_type, .. }
            | MembershipEvent::MachineDeleted { machine_type, .. }
            | MembershipEvent::LeaderChanged { machine_type, .. } => machine_type,
        }
    }
}

/// Machine table with a per-type leader flag
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert-if-absent; fails with `MachineExists` on an id collision
    async fn create_machine(
        &self,
        machine_id: &MachineId,
        machine_type: &str,
    ) -> ChorusResult<Machine>;

    /// Refresh `last_updated`; `MachineNotFound` if the row is gone
    async fn touch_machine(&self, machine_id: &MachineId) -> ChorusResult<()>;

    /// Returns whether a row was actually removed
    async fn delete_machine(&self, machine_id: &MachineId) -> ChorusResult<bool>;

    async fn get_machine(&self, machine_id: &MachineId) -> ChorusResult<Option<Machine>>;

    async fn get_machines_by_type(&self, machine_type: &str) -> ChorusResult<Vec<Machine>>;

    /// Machines of `machine_type` whose heartbeat is older than `threshold`
    async fn get_expired_machines(
        &self,
        machine_type: &str,
        threshold: Duration,
    ) -> ChorusResult<Vec<Machine>>;

    /// Row present and heartbeat within `threshold`
    async fn is_machine_live(&self, machine_id: &MachineId, threshold: Duration)
        -> ChorusResult<bool>;

    async fn get_leader_for_type(&self, machine_type: &str) -> ChorusResult<Option<Machine>>;

    /// Atomically flag `machine_id` as leader if no machine of `machine_type`
    /// holds the flag. `false` when someone else already leads or the row is gone.
    async fn try_set_leader(&self, machine_id: &MachineId, machine_type: &str)
        -> ChorusResult<bool>;

    /// Push notifications; a store without push hands out a receiver that never fires
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Room rows, room membership and the connection table
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Fails with `RoomExists` if the id is taken
    async fn create_room(&self, room: &RoomRecord) -> ChorusResult<()>;

    async fn get_room(&self, room_id: &RoomId) -> ChorusResult<Option<RoomRecord>>;

    /// Deletes the room and its membership
    async fn delete_room(&self, room_id: &RoomId) -> ChorusResult<bool>;

    async fn get_rooms_by_machine(&self, machine_id: &MachineId) -> ChorusResult<Vec<RoomRecord>>;

    /// Rooms whose owner row is missing or older than `threshold`
    async fn get_orphaned_rooms(&self, threshold: Duration) -> ChorusResult<Vec<RoomRecord>>;

    /// Compare-and-set on the owner column; `false` if the owner is no longer `old_owner`
    async fn set_room_owner(
        &self,
        room_id: &RoomId,
        old_owner: &MachineId,
        new_owner: &MachineId,
    ) -> ChorusResult<bool>;

    async fn get_room_members(&self, room_id: &RoomId) -> ChorusResult<Vec<ConnectionId>>;

    /// `RoomNotFound` if the room does not exist; `false` if already a member
    async fn add_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool>;

    async fn remove_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool>;

    async fn clear_room_members(&self, room_id: &RoomId) -> ChorusResult<()>;

    async fn create_connection(
        &self,
        connection_id: &ConnectionId,
        machine_id: &MachineId,
    ) -> ChorusResult<Connection>;

    async fn touch_connection(&self, connection_id: &ConnectionId) -> ChorusResult<()>;

    /// Deletes the connection and every membership it holds
    async fn delete_connection(&self, connection_id: &ConnectionId) -> ChorusResult<bool>;

    async fn find_machine_for_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> ChorusResult<Option<MachineId>>;

    async fn get_expired_connections(&self, threshold: Duration) -> ChorusResult<Vec<Connection>>;
}

/// Distributed hash with per-field expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> ChorusResult<bool>;

    async fn hget(&self, hash: &str, field: &str) -> ChorusResult<Option<String>>;

    /// Number of fields removed
    async fn hdel(&self, hash: &str, fields: &[String]) -> ChorusResult<u64>;

    /// Delete `field` only while it still holds `expected`
    async fn hdel_if_eq(&self, hash: &str, field: &str, expected: &str) -> ChorusResult<bool>;

    /// Set the expiry of each existing field to `ttl` from now
    async fn hexpire(&self, hash: &str, fields: &[String], ttl: Duration) -> ChorusResult<()>;

    async fn hkeys(&self, hash: &str) -> ChorusResult<Vec<String>>;
}

/// Run a store call under a deadline, mapping elapsed time to `ChorusError::Timeout`
pub async fn store_call<T, F>(limit: Duration, operation: &str, call: F) -> ChorusResult<T>
where
    F: Future<Output = ChorusResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ChorusError::timeout(operation)),
    }
}

/// One handle per collaborator, shared by every service in a process
#[derive(Clone)]
pub struct StoreBackend {
    pub membership: Arc<dyn MembershipStore>,
    pub rooms: Arc<dyn RoomStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn PubSubTransport>,
}

impl StoreBackend {
    /// Fresh in-memory backend on the system clock
    pub fn memory() -> Self {
        Self::memory_with_clock(Arc::new(SystemClock))
    }

    pub fn memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::from_memory(
            Arc::new(MemoryStore::new(clock)),
            Arc::new(MemoryPubSub::new()),
        )
    }

    /// Share an existing in-memory store, e.g. between simulated machines in a test
    pub fn from_memory(store: Arc<MemoryStore>, transport: Arc<MemoryPubSub>) -> Self {
        Self {
            membership: store.clone(),
            rooms: store.clone(),
            kv: store,
            transport,
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackend").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_store_call_times_out() {
        let result: ChorusResult<()> = store_call(
            Duration::from_secs(5),
            "touch_machine",
            std::future::pending(),
        )
        .await;

        match result {
            Err(ChorusError::Timeout { operation }) => assert_eq!(operation, "touch_machine"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_call_passes_through() {
        let ok = store_call(Duration::from_secs(5), "op", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: ChorusResult<()> =
            store_call(Duration::from_secs(5), "op", async { Err(ChorusError::store("down")) })
                .await;
        assert!(err.unwrap_err().is_transient());
    }

    #[test]
    fn test_event_machine_type() {
        let event = MembershipEvent::LeaderChanged {
            machine_type: "RS".into(),
            machine_id: MachineId::generate("RS"),
        };
        assert_eq!(event.machine_type(), "RS");
    }
}
