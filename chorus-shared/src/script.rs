//! Boundary to the per-room scripting sandbox

use crate::exception::{ChorusError, ChorusResult};
use crate::message::{Command, Message};
use crate::room::RoomRecord;

/// Script that relays traffic and ends the room once the last member leaves
pub const END_WHEN_EMPTY_SCRIPT: &str = "relay:end-when-empty";

/// What a script asks its room to do
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEffect {
    /// Publish on the room topic
    Send(Message),
    /// Destroy the room
    EndRoom,
}

/// A room's bound admin logic
pub trait ScriptContext: Send {
    fn on_message(&mut self, message: &Message) -> Vec<ScriptEffect>;

    fn on_room_empty(&mut self) -> Vec<ScriptEffect>;
}

/// Creates script contexts from a room's persisted admin script
pub trait ScriptSandbox: Send + Sync {
    fn bind(&self, room: &RoomRecord) -> ChorusResult<Box<dyn ScriptContext>>;
}

/// Default sandbox: rebroadcasts room commands to all members
#[derive(Debug, Default, Clone, Copy)]
pub struct RelaySandbox;

impl ScriptSandbox for RelaySandbox {
    fn bind(&self, room: &RoomRecord) -> ChorusResult<Box<dyn ScriptContext>> {
        let script = room.admin_script.trim();
        if script.is_empty() {
            return Err(ChorusError::binding(
                room.room_id.as_str(),
                "admin script is empty",
            ));
        }
        Ok(Box::new(RelayContext {
            room: room.clone(),
            end_when_empty: script == END_WHEN_EMPTY_SCRIPT,
        }))
    }
}

struct RelayContext {
    room: RoomRecord,
    end_when_empty: bool,
}

impl ScriptContext for RelayContext {
    fn on_message(&mut self, message: &Message) -> Vec<ScriptEffect> {
        match &message.cmd {
            Command::Room(name) => {
                let mut relayed = Message::new(
                    self.room.room_id.clone(),
                    self.room.room_id.listener_id(),
                    Command::Room(name.clone()),
                )
                .with_data("origin", message.sender_id.as_str());
                for (key, value) in &message.data {
                    relayed.data.entry(key.clone()).or_insert_with(|| value.clone());
                }
                vec![ScriptEffect::Send(relayed)]
            }
            _ => Vec::new(),
        }
    }

    fn on_room_empty(&mut self) -> Vec<ScriptEffect> {
        if self.end_when_empty {
            vec![ScriptEffect::EndRoom]
        } else {
            Vec::new()
        }
    }
}
