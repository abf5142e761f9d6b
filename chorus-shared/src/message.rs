use crate::exception::ChorusResult;
use crate::ids::{ListenerId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of commands exchanged on a room topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Command {
    /// Presence probe sent by a newly bound room
    Ping,
    /// Reply to a probe from a connection still in the room
    Pong,
    Join,
    Leave,
    /// Application-level room command, handed to the admin script
    Room(String),
    Error(String),
}

/// Envelope published on room and machine topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub room_id: RoomId,
    pub sender_id: ListenerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<ListenerId>,
    pub cmd: Command,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(room_id: RoomId, sender_id: ListenerId, cmd: Command) -> Self {
        Self {
            room_id,
            sender_id,
            receiver_id: None,
            cmd,
            data: Map::new(),
        }
    }

    pub fn to(mut self, receiver_id: ListenerId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> ChorusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> ChorusResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
