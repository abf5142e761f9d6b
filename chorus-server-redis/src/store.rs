//! Membership, room and hash stores on top of plain Redis structures
//!
//! Key layout under `<prefix>:`
//!
//! | key                        | type   | contents                                   |
//! |----------------------------|--------|--------------------------------------------|
//! | `machines/<id>`            | hash   | `type`, `created_at`, `last_updated` (ms)  |
//! | `machine-types/<type>`     | set    | machine ids of that type                   |
//! | `leaders/<type>`           | string | id of the flagged leader                   |
//! | `rooms/<id>`               | string | JSON room record                           |
//! | `room-index`               | set    | every room id                              |
//! | `machine-rooms/<machine>`  | set    | room ids owned by a machine                |
//! | `room-members/<room>`      | set    | connection ids                             |
//! | `connections/<id>`         | hash   | `machine_id`, `created_at`, `last_updated` |
//! | `connection-index`         | set    | every connection id                        |
//! | `connection-rooms/<id>`    | set    | rooms a connection is a member of          |
//! | `hash/<name>`              | hash   | distributed hash with per-field expiry     |
//!
//! Multi-key updates run as Lua scripts so each one is atomic on the server.
//! Field expiry relies on `HPEXPIRE`, available from Redis 7.4.
//!
//! Only a single Redis instance (optionally with replicas) is supported, not
//! Redis Cluster. Keys known up front are passed in `KEYS`, but several
//! scripts reach keys named by stored data (a machine's type, the current
//! leader, a room's owner or members) and build them from the prefix in
//! `ARGV`. Those keys can live on any slot.

use crate::client::RedisClient;
use crate::{RedisBackendError, RedisResult};
use async_trait::async_trait;
use chorus_shared::{
    ChorusError, ChorusResult, Connection, ConnectionId, KeyValueStore, Machine, MachineId,
    MembershipEvent, MembershipStore, RoomId, RoomRecord, RoomStore,
};
use chorus_util::{Clock, SystemClock, TimeUtils};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const EVENT_CAPACITY: usize = 256;

const CREATE_MACHINE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'type', ARGV[2], 'created_at', ARGV[3], 'last_updated', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

const TOUCH_HASH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'last_updated', ARGV[1])
return 1
"#;

const DELETE_MACHINE: &str = r#"
local machine_type = redis.call('HGET', KEYS[1], 'type')
if not machine_type then return false end
redis.call('DEL', KEYS[1])
redis.call('SREM', ARGV[2] .. ':machine-types/' .. machine_type, ARGV[1])
local leader_key = ARGV[2] .. ':leaders/' .. machine_type
if redis.call('GET', leader_key) == ARGV[1] then redis.call('DEL', leader_key) end
return machine_type
"#;

const TRY_SET_LEADER: &str = r#"
if redis.call('HGET', KEYS[1], 'type') ~= ARGV[2] then return 0 end
local current = redis.call('GET', KEYS[2])
if current and redis.call('EXISTS', ARGV[3] .. ':machines/' .. current) == 1 then return 0 end
redis.call('SET', KEYS[2], ARGV[1])
return 1
"#;

const CREATE_ROOM: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

const DELETE_ROOM: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local room = cjson.decode(raw)
redis.call('SREM', ARGV[2] .. ':machine-rooms/' .. room.owner, ARGV[1])
for _, member in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  redis.call('SREM', ARGV[2] .. ':connection-rooms/' .. member, ARGV[1])
end
redis.call('DEL', KEYS[1], KEYS[3])
redis.call('SREM', KEYS[2], ARGV[1])
return 1
"#;

const SWAP_ROOM: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SREM', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[3])
return 1
"#;

const ADD_MEMBER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('SADD', KEYS[3], ARGV[2])
return redis.call('SADD', KEYS[2], ARGV[1])
"#;

const CLEAR_MEMBERS: &str = r#"
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  redis.call('SREM', ARGV[2] .. ':connection-rooms/' .. member, ARGV[1])
end
redis.call('DEL', KEYS[1])
return 1
"#;

const DELETE_CONNECTION: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
for _, room in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  redis.call('SREM', ARGV[2] .. ':room-members/' .. room, ARGV[1])
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('SREM', KEYS[3], ARGV[1])
return existed
"#;

const HDEL_IF_EQ: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

/// Wire form of [`MembershipEvent`] on the events channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EventFrame {
    MachineCreated {
        machine_id: String,
        machine_type: String,
    },
    MachineDeleted {
        machine_id: String,
        machine_type: String,
    },
    LeaderChanged {
        machine_id: String,
        machine_type: String,
    },
}

impl From<&MembershipEvent> for EventFrame {
    fn from(event: &MembershipEvent) -> Self {
        match event {
            MembershipEvent::MachineCreated {
                machine_id,
                machine_type,
            } => EventFrame::MachineCreated {
                machine_id: machine_id.to_string(),
                machine_type: machine_type.clone(),
            },
            MembershipEvent::MachineDeleted {
                machine_id,
                machine_type,
            } => EventFrame::MachineDeleted {
                machine_id: machine_id.to_string(),
                machine_type: machine_type.clone(),
            },
            MembershipEvent::LeaderChanged {
                machine_type,
                machine_id,
            } => EventFrame::LeaderChanged {
                machine_id: machine_id.to_string(),
                machine_type: machine_type.clone(),
            },
        }
    }
}

impl From<EventFrame> for MembershipEvent {
    fn from(frame: EventFrame) -> Self {
        match frame {
            EventFrame::MachineCreated {
                machine_id,
                machine_type,
            } => MembershipEvent::MachineCreated {
                machine_id: MachineId::new(machine_id),
                machine_type,
            },
            EventFrame::MachineDeleted {
                machine_id,
                machine_type,
            } => MembershipEvent::MachineDeleted {
                machine_id: MachineId::new(machine_id),
                machine_type,
            },
            EventFrame::LeaderChanged {
                machine_id,
                machine_type,
            } => MembershipEvent::LeaderChanged {
                machine_type,
                machine_id: MachineId::new(machine_id),
            },
        }
    }
}

fn millis_to_datetime(key: &str, raw: Option<&String>) -> RedisResult<DateTime<Utc>> {
    let ms: i64 = raw
        .ok_or_else(|| RedisBackendError::corrupt_record(key, "missing timestamp"))?
        .parse()
        .map_err(|e| RedisBackendError::corrupt_record(key, format!("bad timestamp: {}", e)))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RedisBackendError::corrupt_record(key, "timestamp out of range"))
}

fn cutoff_millis(now: DateTime<Utc>, threshold: Duration) -> i64 {
    now.timestamp_millis() - TimeUtils::to_chrono(threshold).num_milliseconds()
}

/// All three store traits over one Redis deployment
pub struct RedisStore {
    client: RedisClient,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MembershipEvent>,
    shutdown: CancellationToken,
}

impl RedisStore {
    /// Build the store and start forwarding the events channel into local subscribers
    pub async fn new(client: RedisClient) -> RedisResult<Self> {
        Self::with_clock(client, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(client: RedisClient, clock: Arc<dyn Clock>) -> RedisResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let mut pubsub = client.pubsub().await?;
        let channel = client.key("events");
        pubsub.subscribe(&channel).await?;

        let sender = events.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => {
                        let Some(msg) = next else {
                            warn!("Membership event channel closed; followers fall back to polling");
                            break;
                        };
                        match serde_json::from_slice::<EventFrame>(msg.get_payload_bytes()) {
                            Ok(frame) => {
                                // No receivers is fine
                                let _ = sender.send(frame.into());
                            }
                            Err(e) => warn!("Ignoring malformed membership event: {}", e),
                        }
                    }
                }
            }
            debug!("Membership event forwarder stopped");
        });

        Ok(Self {
            client,
            clock,
            events,
            shutdown,
        })
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn machine_key(&self, machine_id: &MachineId) -> String {
        self.client.key(format!("machines/{}", machine_id))
    }

    fn machine_type_key(&self, machine_type: &str) -> String {
        self.client.key(format!("machine-types/{}", machine_type))
    }

    fn leader_key(&self, machine_type: &str) -> String {
        self.client.key(format!("leaders/{}", machine_type))
    }

    fn room_key(&self, room_id: &RoomId) -> String {
        self.client.key(format!("rooms/{}", room_id))
    }

    fn room_index_key(&self) -> String {
        self.client.key("room-index")
    }

    fn machine_rooms_key(&self, machine_id: &MachineId) -> String {
        self.client.key(format!("machine-rooms/{}", machine_id))
    }

    fn members_key(&self, room_id: &RoomId) -> String {
        self.client.key(format!("room-members/{}", room_id))
    }

    fn connection_key(&self, connection_id: &ConnectionId) -> String {
        self.client.key(format!("connections/{}", connection_id))
    }

    fn connection_index_key(&self) -> String {
        self.client.key("connection-index")
    }

    fn connection_rooms_key(&self, connection_id: &ConnectionId) -> String {
        self.client.key(format!("connection-rooms/{}", connection_id))
    }

    fn hash_key(&self, hash: &str) -> String {
        self.client.key(format!("hash/{}", hash))
    }

    /// Publish to other processes; local subscribers hear it back through the forwarder
    async fn notify(&self, event: MembershipEvent) {
        let payload = match serde_json::to_vec(&EventFrame::from(&event)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode membership event: {}", e);
                return;
            }
        };
        let channel = self.client.key("events");
        let mut conn = self.client.connection();
        let published: RedisResult<i64> = self
            .client
            .run("PUBLISH", conn.publish(channel, payload))
            .await;
        if let Err(e) = published {
            warn!("Failed to publish membership event: {}", e);
        }
    }

    async fn load_machine(
        &self,
        machine_id: &MachineId,
        leader: Option<&str>,
    ) -> RedisResult<Option<Machine>> {
        let key = self.machine_key(machine_id);
        let mut conn = self.client.connection();
        let fields: HashMap<String, String> =
            self.client.run("HGETALL", conn.hgetall(&key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let machine_type = fields
            .get("type")
            .cloned()
            .ok_or_else(|| RedisBackendError::corrupt_record(&key, "missing type"))?;

        let leader = match leader {
            Some(current) => current == machine_id.as_str(),
            None => {
                let current: Option<String> = self
                    .client
                    .run("GET", conn.get(self.leader_key(&machine_type)))
                    .await?;
                current.as_deref() == Some(machine_id.as_str())
            }
        };

        Ok(Some(Machine {
            id: machine_id.clone(),
            machine_type,
            leader,
            created_at: millis_to_datetime(&key, fields.get("created_at"))?,
            last_updated: millis_to_datetime(&key, fields.get("last_updated"))?,
        }))
    }

    async fn machines_of_type(&self, machine_type: &str) -> RedisResult<Vec<Machine>> {
        let mut conn = self.client.connection();
        let ids: BTreeSet<String> = self
            .client
            .run("SMEMBERS", conn.smembers(self.machine_type_key(machine_type)))
            .await?;
        let leader: Option<String> = self
            .client
            .run("GET", conn.get(self.leader_key(machine_type)))
            .await?;
        let leader = leader.unwrap_or_default();

        let mut machines = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(machine) = self
                .load_machine(&MachineId::new(id), Some(leader.as_str()))
                .await?
            {
                machines.push(machine);
            }
        }
        Ok(machines)
    }

    async fn last_updated_millis(&self, key: &str) -> RedisResult<Option<i64>> {
        let mut conn = self.client.connection();
        let raw: Option<String> = self
            .client
            .run("HGET", conn.hget(key, "last_updated"))
            .await?;
        raw.map(|v| {
            v.parse::<i64>()
                .map_err(|e| RedisBackendError::corrupt_record(key, e.to_string()))
        })
        .transpose()
    }

    async fn load_rooms(&self, ids: Vec<String>) -> RedisResult<Vec<RoomRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.room_key(&RoomId::new(id.as_str())))
            .collect();
        let mut conn = self.client.connection();
        let raws: Vec<Option<String>> = self
            .client
            .run("MGET", redis::cmd("MGET").arg(&keys).query_async(&mut conn))
            .await?;

        let mut rooms = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            rooms.push(serde_json::from_str::<RoomRecord>(&raw)?);
        }
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    async fn load_connection(&self, connection_id: &ConnectionId) -> RedisResult<Option<Connection>> {
        let key = self.connection_key(connection_id);
        let mut conn = self.client.connection();
        let fields: HashMap<String, String> =
            self.client.run("HGETALL", conn.hgetall(&key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let machine_id = fields
            .get("machine_id")
            .ok_or_else(|| RedisBackendError::corrupt_record(&key, "missing machine_id"))?;
        Ok(Some(Connection {
            connection_id: connection_id.clone(),
            machine_id: MachineId::new(machine_id.as_str()),
            created_at: millis_to_datetime(&key, fields.get("created_at"))?,
            last_updated: millis_to_datetime(&key, fields.get("last_updated"))?,
        }))
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    async fn create_machine(
        &self,
        machine_id: &MachineId,
        machine_type: &str,
    ) -> ChorusResult<Machine> {
        let now = self.now_millis();
        let mut conn = self.client.connection();
        let created: i64 = self
            .client
            .run(
                "create_machine",
                Script::new(CREATE_MACHINE)
                    .key(self.machine_key(machine_id))
                    .key(self.machine_type_key(machine_type))
                    .arg(machine_id.as_str())
                    .arg(machine_type)
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await?;
        if created == 0 {
            return Err(ChorusError::machine_exists(machine_id.as_str()));
        }

        debug!("Created machine {}", machine_id);
        self.notify(MembershipEvent::MachineCreated {
            machine_id: machine_id.clone(),
            machine_type: machine_type.to_string(),
        })
        .await;

        let created_at = Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(|| self.clock.now());
        Ok(Machine::new(machine_id.clone(), machine_type, created_at))
    }

    async fn touch_machine(&self, machine_id: &MachineId) -> ChorusResult<()> {
        let mut conn = self.client.connection();
        let touched: i64 = self
            .client
            .run(
                "touch_machine",
                Script::new(TOUCH_HASH)
                    .key(self.machine_key(machine_id))
                    .arg(self.now_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        if touched == 0 {
            return Err(ChorusError::machine_not_found(machine_id.as_str()));
        }
        Ok(())
    }

    async fn delete_machine(&self, machine_id: &MachineId) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let deleted: Option<String> = self
            .client
            .run(
                "delete_machine",
                Script::new(DELETE_MACHINE)
                    .key(self.machine_key(machine_id))
                    .arg(machine_id.as_str())
                    .arg(self.client.prefix())
                    .invoke_async(&mut conn),
            )
            .await?;

        match deleted {
            Some(machine_type) => {
                debug!("Deleted machine {}", machine_id);
                self.notify(MembershipEvent::MachineDeleted {
                    machine_id: machine_id.clone(),
                    machine_type,
                })
                .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_machine(&self, machine_id: &MachineId) -> ChorusResult<Option<Machine>> {
        Ok(self.load_machine(machine_id, None).await?)
    }

    async fn get_machines_by_type(&self, machine_type: &str) -> ChorusResult<Vec<Machine>> {
        Ok(self.machines_of_type(machine_type).await?)
    }

    async fn get_expired_machines(
        &self,
        machine_type: &str,
        threshold: Duration,
    ) -> ChorusResult<Vec<Machine>> {
        let now = self.clock.now();
        Ok(self
            .machines_of_type(machine_type)
            .await?
            .into_iter()
            .filter(|m| m.is_stale(now, threshold))
            .collect())
    }

    async fn is_machine_live(
        &self,
        machine_id: &MachineId,
        threshold: Duration,
    ) -> ChorusResult<bool> {
        let cutoff = cutoff_millis(self.clock.now(), threshold);
        let last_updated = self
            .last_updated_millis(&self.machine_key(machine_id))
            .await?;
        Ok(matches!(last_updated, Some(ms) if ms >= cutoff))
    }

    async fn get_leader_for_type(&self, machine_type: &str) -> ChorusResult<Option<Machine>> {
        let mut conn = self.client.connection();
        let leader: Option<String> = self
            .client
            .run("GET", conn.get(self.leader_key(machine_type)))
            .await?;
        match leader {
            Some(id) => Ok(self
                .load_machine(&MachineId::new(id.as_str()), Some(id.as_str()))
                .await?),
            None => Ok(None),
        }
    }

    async fn try_set_leader(
        &self,
        machine_id: &MachineId,
        machine_type: &str,
    ) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let won: i64 = self
            .client
            .run(
                "try_set_leader",
                Script::new(TRY_SET_LEADER)
                    .key(self.machine_key(machine_id))
                    .key(self.leader_key(machine_type))
                    .arg(machine_id.as_str())
                    .arg(machine_type)
                    .arg(self.client.prefix())
                    .invoke_async(&mut conn),
            )
            .await?;
        if won == 0 {
            return Ok(false);
        }

        self.notify(MembershipEvent::LeaderChanged {
            machine_type: machine_type.to_string(),
            machine_id: machine_id.clone(),
        })
        .await;
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn create_room(&self, room: &RoomRecord) -> ChorusResult<()> {
        let json = serde_json::to_string(room)?;
        let mut conn = self.client.connection();
        let created: i64 = self
            .client
            .run(
                "create_room",
                Script::new(CREATE_ROOM)
                    .key(self.room_key(&room.room_id))
                    .key(self.room_index_key())
                    .key(self.machine_rooms_key(&room.owner))
                    .arg(json)
                    .arg(room.room_id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        if created == 0 {
            return Err(ChorusError::room_exists(room.room_id.as_str()));
        }
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> ChorusResult<Option<RoomRecord>> {
        let mut conn = self.client.connection();
        let raw: Option<String> = self
            .client
            .run("GET", conn.get(self.room_key(room_id)))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete_room(&self, room_id: &RoomId) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let deleted: i64 = self
            .client
            .run(
                "delete_room",
                Script::new(DELETE_ROOM)
                    .key(self.room_key(room_id))
                    .key(self.room_index_key())
                    .key(self.members_key(room_id))
                    .arg(room_id.as_str())
                    .arg(self.client.prefix())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn get_rooms_by_machine(&self, machine_id: &MachineId) -> ChorusResult<Vec<RoomRecord>> {
        let mut conn = self.client.connection();
        let ids: Vec<String> = self
            .client
            .run("SMEMBERS", conn.smembers(self.machine_rooms_key(machine_id)))
            .await?;
        Ok(self
            .load_rooms(ids)
            .await?
            .into_iter()
            .filter(|r| &r.owner == machine_id)
            .collect())
    }

    async fn get_orphaned_rooms(&self, threshold: Duration) -> ChorusResult<Vec<RoomRecord>> {
        let mut conn = self.client.connection();
        let ids: Vec<String> = self
            .client
            .run("SMEMBERS", conn.smembers(self.room_index_key()))
            .await?;
        let rooms = self.load_rooms(ids).await?;

        let mut liveness: HashMap<MachineId, bool> = HashMap::new();
        let mut orphaned = Vec::new();
        for room in rooms {
            let live = match liveness.get(&room.owner) {
                Some(live) => *live,
                None => {
                    let live = self.is_machine_live(&room.owner, threshold).await?;
                    liveness.insert(room.owner.clone(), live);
                    live
                }
            };
            if !live {
                orphaned.push(room);
            }
        }
        Ok(orphaned)
    }

    async fn set_room_owner(
        &self,
        room_id: &RoomId,
        old_owner: &MachineId,
        new_owner: &MachineId,
    ) -> ChorusResult<bool> {
        let key = self.room_key(room_id);
        loop {
            let mut conn = self.client.connection();
            let raw: Option<String> = self.client.run("GET", conn.get(&key)).await?;
            let Some(raw) = raw else {
                return Ok(false);
            };
            let mut room: RoomRecord = serde_json::from_str(&raw)?;
            if &room.owner != old_owner {
                return Ok(false);
            }
            room.owner = new_owner.clone();
            room.last_updated = self.clock.now();
            let updated = serde_json::to_string(&room)?;

            let swapped: i64 = self
                .client
                .run(
                    "set_room_owner",
                    Script::new(SWAP_ROOM)
                        .key(&key)
                        .key(self.machine_rooms_key(old_owner))
                        .key(self.machine_rooms_key(new_owner))
                        .arg(&raw)
                        .arg(updated)
                        .arg(room_id.as_str())
                        .invoke_async(&mut conn),
                )
                .await?;
            if swapped == 1 {
                return Ok(true);
            }
            // Record changed underneath us; re-read and re-check the owner
            debug!("Room {} changed during owner swap, retrying", room_id);
        }
    }

    async fn get_room_members(&self, room_id: &RoomId) -> ChorusResult<Vec<ConnectionId>> {
        let mut conn = self.client.connection();
        let members: BTreeSet<String> = self
            .client
            .run("SMEMBERS", conn.smembers(self.members_key(room_id)))
            .await?;
        Ok(members.into_iter().map(ConnectionId::new).collect())
    }

    async fn add_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let added: i64 = self
            .client
            .run(
                "add_room_member",
                Script::new(ADD_MEMBER)
                    .key(self.room_key(room_id))
                    .key(self.members_key(room_id))
                    .key(self.connection_rooms_key(connection_id))
                    .arg(connection_id.as_str())
                    .arg(room_id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        match added {
            -1 => Err(ChorusError::room_not_found(room_id.as_str())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn remove_room_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let (removed, _): (i64, i64) = self
            .client
            .run(
                "remove_room_member",
                redis::pipe()
                    .atomic()
                    .srem(self.members_key(room_id), connection_id.as_str())
                    .srem(self.connection_rooms_key(connection_id), room_id.as_str())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn clear_room_members(&self, room_id: &RoomId) -> ChorusResult<()> {
        let mut conn = self.client.connection();
        let _: i64 = self
            .client
            .run(
                "clear_room_members",
                Script::new(CLEAR_MEMBERS)
                    .key(self.members_key(room_id))
                    .arg(room_id.as_str())
                    .arg(self.client.prefix())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn create_connection(
        &self,
        connection_id: &ConnectionId,
        machine_id: &MachineId,
    ) -> ChorusResult<Connection> {
        let now = self.clock.now();
        let ms = now.timestamp_millis();
        let mut conn = self.client.connection();
        let _: () = self
            .client
            .run(
                "create_connection",
                redis::pipe()
                    .atomic()
                    .hset_multiple(
                        self.connection_key(connection_id),
                        &[
                            ("machine_id", machine_id.to_string()),
                            ("created_at", ms.to_string()),
                            ("last_updated", ms.to_string()),
                        ],
                    )
                    .ignore()
                    .sadd(self.connection_index_key(), connection_id.as_str())
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(Connection::new(connection_id.clone(), machine_id.clone(), now))
    }

    async fn touch_connection(&self, connection_id: &ConnectionId) -> ChorusResult<()> {
        let mut conn = self.client.connection();
        let _: i64 = self
            .client
            .run(
                "touch_connection",
                Script::new(TOUCH_HASH)
                    .key(self.connection_key(connection_id))
                    .arg(self.now_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &ConnectionId) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let existed: i64 = self
            .client
            .run(
                "delete_connection",
                Script::new(DELETE_CONNECTION)
                    .key(self.connection_key(connection_id))
                    .key(self.connection_rooms_key(connection_id))
                    .key(self.connection_index_key())
                    .arg(connection_id.as_str())
                    .arg(self.client.prefix())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(existed == 1)
    }

    async fn find_machine_for_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> ChorusResult<Option<MachineId>> {
        let mut conn = self.client.connection();
        let machine: Option<String> = self
            .client
            .run("HGET", conn.hget(self.connection_key(connection_id), "machine_id"))
            .await?;
        Ok(machine.map(MachineId::new))
    }

    async fn get_expired_connections(&self, threshold: Duration) -> ChorusResult<Vec<Connection>> {
        let mut conn = self.client.connection();
        let ids: BTreeSet<String> = self
            .client
            .run("SMEMBERS", conn.smembers(self.connection_index_key()))
            .await?;

        let now = self.clock.now();
        let mut expired = Vec::new();
        for id in ids {
            let connection_id = ConnectionId::new(id);
            if let Some(connection) = self.load_connection(&connection_id).await? {
                if connection.is_stale(now, threshold) {
                    expired.push(connection);
                }
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        Ok(self
            .client
            .run("HSETNX", conn.hset_nx(self.hash_key(hash), field, value))
            .await?)
    }

    async fn hget(&self, hash: &str, field: &str) -> ChorusResult<Option<String>> {
        let mut conn = self.client.connection();
        Ok(self
            .client
            .run("HGET", conn.hget(self.hash_key(hash), field))
            .await?)
    }

    async fn hdel(&self, hash: &str, fields: &[String]) -> ChorusResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.client.connection();
        Ok(self
            .client
            .run("HDEL", conn.hdel(self.hash_key(hash), fields))
            .await?)
    }

    async fn hdel_if_eq(&self, hash: &str, field: &str, expected: &str) -> ChorusResult<bool> {
        let mut conn = self.client.connection();
        let removed: i64 = self
            .client
            .run(
                "hdel_if_eq",
                Script::new(HDEL_IF_EQ)
                    .key(self.hash_key(hash))
                    .arg(field)
                    .arg(expected)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn hexpire(&self, hash: &str, fields: &[String], ttl: Duration) -> ChorusResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.client.connection();
        // One status per field; -2 marks a field that is already gone
        let _: Vec<i64> = self
            .client
            .run(
                "HPEXPIRE",
                redis::cmd("HPEXPIRE")
                    .arg(self.hash_key(hash))
                    .arg(ttl_ms)
                    .arg("FIELDS")
                    .arg(fields.len())
                    .arg(fields)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn hkeys(&self, hash: &str) -> ChorusResult<Vec<String>> {
        let mut conn = self.client.connection();
        Ok(self
            .client
            .run("HKEYS", conn.hkeys(self.hash_key(hash)))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_round_trip() {
        let event = MembershipEvent::LeaderChanged {
            machine_type: "RS".into(),
            machine_id: MachineId::new("Machine:RS:abc"),
        };
        let json = serde_json::to_string(&EventFrame::from(&event)).unwrap();
        assert!(json.contains("\"kind\":\"leader_changed\""));

        let frame: EventFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(MembershipEvent::from(frame), event);
    }

    #[test]
    fn test_millis_to_datetime() {
        let raw = "1700000000123".to_string();
        let ts = millis_to_datetime("k", Some(&raw)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);

        assert!(millis_to_datetime("k", None).is_err());
        assert!(millis_to_datetime("k", Some(&"soon".to_string())).is_err());
    }

    #[test]
    fn test_cutoff_millis() {
        let now = Utc.timestamp_millis_opt(10_000).single().unwrap();
        assert_eq!(cutoff_millis(now, Duration::from_secs(5)), 5_000);
    }
}
