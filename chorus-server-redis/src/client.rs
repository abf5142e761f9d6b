use crate::{RedisBackendError, RedisConfig, RedisResult};
use redis::aio::{MultiplexedConnection, PubSub};
use std::future::Future;
use tracing::{debug, info};

/// Connection handle shared by the store and the pub/sub transport
///
/// Commands go over one multiplexed connection; every subscription opens
/// its own dedicated connection since a subscribed connection cannot issue
/// regular commands.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    connection: MultiplexedConnection,
    config: RedisConfig,
}

impl RedisClient {
    pub async fn connect(config: RedisConfig) -> RedisResult<Self> {
        config.validate()?;
        info!(
            "Connecting to Redis at {} (prefix '{}')",
            config.url, config.key_prefix
        );

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisBackendError::configuration(format!("Invalid Redis URL: {}", e)))?;

        let connection = tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| RedisBackendError::timeout("connect"))?
        .map_err(|e| RedisBackendError::connection(e.to_string()))?;

        let this = Self {
            client,
            connection,
            config,
        };
        this.ping().await?;
        Ok(this)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Cheap clone of the multiplexed command connection
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Namespaced key, `<prefix>:<name>`
    pub fn key(&self, name: impl AsRef<str>) -> String {
        format!("{}:{}", self.config.key_prefix, name.as_ref())
    }

    pub fn prefix(&self) -> &str {
        &self.config.key_prefix
    }

    /// Await a command under the configured request timeout
    pub async fn run<T, F>(&self, command: &str, call: F) -> RedisResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RedisBackendError::command(command, e.to_string())),
            Err(_) => Err(RedisBackendError::timeout(command)),
        }
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.connection();
        let reply: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        debug!("Redis PING -> {}", reply);
        Ok(())
    }

    /// Fresh dedicated connection in subscriber mode
    pub async fn pubsub(&self) -> RedisResult<PubSub> {
        let connection = tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_async_connection(),
        )
        .await
        .map_err(|_| RedisBackendError::timeout("subscribe"))?
        .map_err(|e| RedisBackendError::connection(e.to_string()))?;
        Ok(connection.into_pubsub())
    }
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("url", &self.config.url)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}
