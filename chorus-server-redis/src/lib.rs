//! Redis backend for the chorus coordination core
//!
//! Supplies the membership, room, distributed-hash and pub/sub collaborators
//! over a single Redis instance (not Redis Cluster) so machines in different
//! processes share leadership, ownership and room state.

pub mod client;
pub mod config;
pub mod error;
pub mod pubsub;
pub mod store;

pub use client::RedisClient;
pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisBackendError, RedisResult};
pub use pubsub::RedisPubSub;
pub use store::RedisStore;

use chorus_shared::{ChorusResult, StoreBackend};
use std::sync::Arc;
use tracing::info;

/// Entry point wiring a [`StoreBackend`] onto Redis
pub struct RedisBackend;

impl RedisBackend {
    pub async fn connect(config: RedisConfig) -> ChorusResult<StoreBackend> {
        let client = RedisClient::connect(config).await?;
        let store = Arc::new(RedisStore::new(client.clone()).await?);
        let transport = Arc::new(RedisPubSub::new(client.clone()));

        info!("Redis backend ready ({:?})", client);
        Ok(StoreBackend {
            membership: store.clone(),
            rooms: store.clone(),
            kv: store,
            transport,
        })
    }
}
