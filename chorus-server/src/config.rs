//! Server configuration, loaded from TOML

use chorus_shared::config::duration_ms;
use chorus_shared::{ChorusError, ChorusResult, CoordinationConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration of a chorus server process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusServerConfig {
    pub server: ServerSection,
    pub coordination: CoordinationConfig,
    pub backend: BackendConfig,
    pub lobby: LobbyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Election population this process joins, e.g. `RS` for room servers
    pub machine_type: String,
    /// Fixed machine id; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            machine_type: "RS".to_string(),
            machine_id: None,
        }
    }
}

/// Which store and transport to coordinate through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Single-process, for development and tests
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "chorus".to_string()
}

/// The always-present lobby room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub enabled: bool,
    pub room_id: String,
    pub name: String,
    pub script: String,
    /// How long to wait for the lobby claim before leaving it to another machine
    #[serde(with = "duration_ms")]
    pub claim_wait: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            room_id: "GlobalLobby".to_string(),
            name: "Global Lobby".to_string(),
            script: "matchmaker".to_string(),
            claim_wait: Duration::ZERO,
        }
    }
}

impl ChorusServerConfig {
    /// Load configuration from a TOML file
    pub async fn load_from_file(path: &Path) -> ChorusResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ChorusError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChorusError::configuration(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save_to_file(&self, path: &Path) -> ChorusResult<()> {
        let content = self.to_toml()?;
        tokio::fs::write(path, content).await.map_err(|e| {
            ChorusError::configuration(format!("cannot write {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> ChorusResult<()> {
        if self.server.machine_type.trim().is_empty() {
            return Err(ChorusError::configuration("server.machine_type must not be empty"));
        }
        if self.server.machine_type.contains(':') {
            return Err(ChorusError::configuration(
                "server.machine_type must not contain ':'",
            ));
        }
        if let BackendConfig::Redis { url, .. } = &self.backend {
            if url.trim().is_empty() {
                return Err(ChorusError::configuration("backend.url must not be empty"));
            }
        }
        if self.lobby.enabled && self.lobby.room_id.trim().is_empty() {
            return Err(ChorusError::configuration("lobby.room_id must not be empty"));
        }
        self.coordination.validate()
    }

    pub fn to_toml(&self) -> ChorusResult<String> {
        toml::to_string_pretty(self).map_err(|e| ChorusError::configuration(e.to_string()))
    }

    /// Generate example configuration file content
    pub fn generate_example_config() -> ChorusResult<String> {
        Self::default().to_toml()
    }
}
