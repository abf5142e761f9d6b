use chorus_shared::ChorusError;
use thiserror::Error;

/// Result type for Redis backend operations
pub type RedisResult<T> = Result<T, RedisBackendError>;

/// Redis backend errors
#[derive(Error, Debug)]
pub enum RedisBackendError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Script '{script}' returned an unexpected reply: {message}")]
    Script { script: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Corrupt record at {key}: {message}")]
    CorruptRecord { key: String, message: String },

    #[error("Operation timeout: {operation}")]
    Timeout { operation: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RedisBackendError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn script(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            script: script.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn corrupt_record(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether a retry against the same server may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

impl From<RedisBackendError> for ChorusError {
    fn from(error: RedisBackendError) -> Self {
        match error {
            RedisBackendError::Timeout { operation } => ChorusError::timeout(operation),
            RedisBackendError::Configuration { message } => ChorusError::configuration(message),
            RedisBackendError::Json(e) => ChorusError::Serialization(e),
            other => ChorusError::store(other.to_string()),
        }
    }
}
