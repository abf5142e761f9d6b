use crate::ids::{MachineId, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted room row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub name: String,
    pub admin_script: String,
    pub owner: MachineId,
    pub destroy_on_orphan: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl RoomRecord {
    pub fn new(request: NewRoom, owner: MachineId, now: DateTime<Utc>) -> Self {
        Self {
            room_id: request.room_id.unwrap_or_else(RoomId::generate),
            name: request.name,
            admin_script: request.admin_script,
            owner,
            destroy_on_orphan: request.destroy_on_orphan,
            created_at: now,
            last_updated: now,
        }
    }
}

/// Parameters for creating a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub room_id: Option<RoomId>,
    pub name: String,
    pub admin_script: String,
    pub destroy_on_orphan: bool,
}

impl NewRoom {
    /// A room with a generated id that is destroyed when its owner dies
    pub fn new(name: impl Into<String>, admin_script: impl Into<String>) -> Self {
        Self {
            room_id: None,
            name: name.into(),
            admin_script: admin_script.into(),
            destroy_on_orphan: true,
        }
    }

    pub fn with_id(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn destroy_on_orphan(mut self, destroy: bool) -> Self {
        self.destroy_on_orphan = destroy;
        self
    }
}
