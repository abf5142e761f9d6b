//! Identifier newtypes for machines, rooms, connections and topics
//!
//! Every id is a string on the wire and in the store; the wrappers keep a
//! room id from being passed where a machine id is expected.

use chorus_util::RngUtils;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to create a string id wrapper with common trait implementations
#[macro_export]
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            /// Wrap an existing id
            pub fn new<S: Into<String>>(value: S) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_id! {
    /// Process-unique machine id, `Machine:<type>:<uuid>`
    pub struct MachineId;
}

define_id! {
    /// Room id, `R` followed by eight alphanumerics unless chosen explicitly
    pub struct RoomId;
}

define_id! {
    /// Client connection id, `C` followed by eight alphanumerics
    pub struct ConnectionId;
}

define_id! {
    /// Sender/receiver identity carried in messages
    pub struct ListenerId;
}

define_id! {
    /// Pub/sub topic name
    pub struct TopicId;
}

const MACHINE_PREFIX: &str = "Machine";

impl MachineId {
    pub fn generate(machine_type: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            MACHINE_PREFIX,
            machine_type,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// The type segment of a generated id, if the id has the generated shape
    pub fn machine_type(&self) -> Option<&str> {
        let mut parts = self.0.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(MACHINE_PREFIX), Some(machine_type), Some(_)) => Some(machine_type),
            _ => None,
        }
    }

    pub fn topic(&self) -> TopicId {
        TopicId(format!("machine.{}", self.0))
    }
}

impl RoomId {
    pub fn generate() -> Self {
        Self(RngUtils::prefixed_id('R'))
    }

    /// Key under which ownership of this room is claimed
    pub fn resource_key(&self) -> String {
        format!("rooms/{}", self.0)
    }

    pub fn topic(&self) -> TopicId {
        TopicId(format!("room.{}", self.0))
    }

    /// Identity the room itself uses as a message sender
    pub fn listener_id(&self) -> ListenerId {
        ListenerId(format!("room:{}", self.0))
    }
}

impl ConnectionId {
    pub fn generate() -> Self {
        Self(RngUtils::prefixed_id('C'))
    }

    pub fn listener_id(&self) -> ListenerId {
        ListenerId(self.0.clone())
    }
}

impl ListenerId {
    /// Interpret this listener as a client connection
    pub fn to_connection_id(&self) -> ConnectionId {
        ConnectionId(self.0.clone())
    }
}
