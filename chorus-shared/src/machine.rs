use crate::ids::{ConnectionId, MachineId};
use chorus_util::TimeUtils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One fleet process, kept alive by heartbeat touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub machine_type: String,
    pub leader: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Machine {
    pub fn new(id: MachineId, machine_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            machine_type: machine_type.into(),
            leader: false,
            created_at: now,
            last_updated: now,
        }
    }

    /// A machine whose heartbeat is older than `threshold` is offline, whether
    /// or not its row has been removed yet.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        TimeUtils::is_older_than(self.last_updated, now, threshold)
    }
}

/// A client connection hosted by a front-end machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub machine_id: MachineId,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Connection {
    pub fn new(connection_id: ConnectionId, machine_id: MachineId, now: DateTime<Utc>) -> Self {
        Self {
            connection_id,
            machine_id,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        TimeUtils::is_older_than(self.last_updated, now, threshold)
    }
}
