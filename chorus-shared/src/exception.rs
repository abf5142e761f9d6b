use thiserror::Error;

/// Errors raised by the coordination core and its collaborators
#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("Machine already exists: {machine_id}")]
    MachineExists { machine_id: String },

    #[error("Machine not found: {machine_id}")]
    MachineNotFound { machine_id: String },

    #[error("Room already exists: {room_id}")]
    RoomExists { room_id: String },

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Binding failed for room {room_id}: {reason}")]
    Binding { room_id: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChorusError {
    pub fn machine_exists<S: Into<String>>(machine_id: S) -> Self {
        ChorusError::MachineExists {
            machine_id: machine_id.into(),
        }
    }

    pub fn machine_not_found<S: Into<String>>(machine_id: S) -> Self {
        ChorusError::MachineNotFound {
            machine_id: machine_id.into(),
        }
    }

    pub fn room_exists<S: Into<String>>(room_id: S) -> Self {
        ChorusError::RoomExists {
            room_id: room_id.into(),
        }
    }

    pub fn room_not_found<S: Into<String>>(room_id: S) -> Self {
        ChorusError::RoomNotFound {
            room_id: room_id.into(),
        }
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        ChorusError::Store(msg.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ChorusError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn binding<R: Into<String>, S: Into<String>>(room_id: R, reason: S) -> Self {
        ChorusError::Binding {
            room_id: room_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        ChorusError::Transport(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        ChorusError::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ChorusError::Internal(msg.into())
    }

    /// Errors that clear up on their own; background loops retry these on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChorusError::Store(_) | ChorusError::Timeout { .. } | ChorusError::Transport(_)
        )
    }
}

/// Result type for coordination operations
pub type ChorusResult<T> = Result<T, ChorusError>;
