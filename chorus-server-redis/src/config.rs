use crate::{RedisBackendError, RedisResult};
use chorus_shared::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "chorus";

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server URL, `redis://[user:pass@]host:port[/db]`
    pub url: String,

    /// Namespace for every key and channel this backend touches
    pub key_prefix: String,

    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Bound on a single command round trip
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: env::var("CHORUS_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            key_prefix: env::var("CHORUS_REDIS_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> RedisResult<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RedisResult<()> {
        if self.url.is_empty() {
            return Err(RedisBackendError::configuration("Redis URL cannot be empty"));
        }

        if !(self.url.starts_with("redis://")
            || self.url.starts_with("rediss://")
            || self.url.starts_with("redis+unix://")
            || self.url.starts_with("unix://"))
        {
            return Err(RedisBackendError::configuration(format!(
                "Unsupported Redis URL scheme: {}",
                self.url
            )));
        }

        if self.key_prefix.is_empty() {
            return Err(RedisBackendError::configuration("Key prefix cannot be empty"));
        }

        if self.key_prefix.contains(char::is_whitespace) {
            return Err(RedisBackendError::configuration(
                "Key prefix cannot contain whitespace",
            ));
        }

        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(RedisBackendError::configuration(
                "Redis timeouts must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Builder for [`RedisConfig`]; unset fields fall back to the environment defaults
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    key_prefix: Option<String>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl RedisConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> RedisConfig {
        let defaults = RedisConfig::default();
        RedisConfig {
            url: self.url.unwrap_or(defaults.url),
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = RedisConfig::builder()
            .url("redis://cache:6380/2")
            .key_prefix("relay")
            .request_timeout(Duration::from_millis(250))
            .build();

        assert_eq!(config.url, "redis://cache:6380/2");
        assert_eq!(config.key_prefix, "relay");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_scheme = RedisConfig::builder().url("http://localhost").build();
        assert!(bad_scheme.validate().is_err());

        let empty_prefix = RedisConfig::builder()
            .url("redis://localhost")
            .key_prefix("")
            .build();
        assert!(empty_prefix.validate().is_err());

        let zero_timeout = RedisConfig::builder()
            .url("redis://localhost")
            .key_prefix("chorus")
            .connect_timeout(Duration::ZERO)
            .build();
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_uses_millis() {
        let config = RedisConfig::builder()
            .url("redis://localhost")
            .key_prefix("chorus")
            .build();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], 5000);

        let back: RedisConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.request_timeout, config.request_timeout);
    }
}
