use crate::client::RedisClient;
use async_trait::async_trait;
use chorus_shared::{ChorusResult, PubSubTransport, Subscription, TopicId};
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Room fan-out over Redis channels, one channel per topic
///
/// Each subscription owns a dedicated subscriber connection whose messages
/// are forwarded into the [`Subscription`] until the receiver is dropped or
/// the topic is deleted locally. Deleting a topic only ends this process's
/// subscribers; peers notice when their own room goes away.
#[derive(Debug)]
pub struct RedisPubSub {
    client: RedisClient,
    subscriptions: DashMap<TopicId, Vec<CancellationToken>>,
}

impl RedisPubSub {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            subscriptions: DashMap::new(),
        }
    }

    fn channel(&self, topic: &TopicId) -> String {
        self.client.key(format!("topic/{}", topic))
    }

    pub fn local_subscriber_count(&self, topic: &TopicId) -> usize {
        self.subscriptions
            .get(topic)
            .map(|tokens| tokens.iter().filter(|t| !t.is_cancelled()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSub {
    async fn publish(&self, topic: &TopicId, payload: Vec<u8>) -> ChorusResult<()> {
        let mut conn = self.client.connection();
        let receivers: i64 = self
            .client
            .run("PUBLISH", conn.publish(self.channel(topic), payload))
            .await?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &TopicId) -> ChorusResult<Subscription> {
        let mut pubsub = self.client.pubsub().await?;
        pubsub
            .subscribe(self.channel(topic))
            .await
            .map_err(crate::RedisBackendError::from)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        {
            let mut tokens = self.subscriptions.entry(topic.clone()).or_default();
            tokens.retain(|t| !t.is_cancelled());
            tokens.push(token.clone());
        }

        let name = topic.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sender.closed() => break,
                    next = stream.next() => {
                        let Some(msg) = next else {
                            warn!("Subscriber connection for {} closed", name);
                            break;
                        };
                        if sender.send(msg.get_payload_bytes().to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            token.cancel();
            debug!("Stopped forwarding topic {}", name);
        });

        debug!("Subscribed to topic {}", topic);
        Ok(Subscription::new(topic.clone(), receiver))
    }

    async fn delete_topic(&self, topic: &TopicId) -> ChorusResult<()> {
        if let Some((_, tokens)) = self.subscriptions.remove(topic) {
            for token in tokens {
                token.cancel();
            }
        }
        Ok(())
    }
}
