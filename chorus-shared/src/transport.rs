//! Pub/sub transport used to fan out room messages

use crate::exception::ChorusResult;
use crate::ids::TopicId;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A live subscription; messages published after `subscribe` returns are delivered
#[derive(Debug)]
pub struct Subscription {
    topic: TopicId,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: TopicId, receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Next payload, or `None` once the topic is deleted or the transport goes away
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, topic: &TopicId, payload: Vec<u8>) -> ChorusResult<()>;

    async fn subscribe(&self, topic: &TopicId) -> ChorusResult<Subscription>;

    /// Drop every subscriber of `topic`
    async fn delete_topic(&self, topic: &TopicId) -> ChorusResult<()>;
}

/// In-process fan-out transport
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: DashMap<TopicId, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &TopicId) -> usize {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    async fn publish(&self, topic: &TopicId, payload: Vec<u8>) -> ChorusResult<()> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|s| s.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &TopicId) -> ChorusResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.topics.entry(topic.clone()).or_default().push(sender);
        debug!("Subscribed to topic {}", topic);
        Ok(Subscription::new(topic.clone(), receiver))
    }

    async fn delete_topic(&self, topic: &TopicId) -> ChorusResult<()> {
        self.topics.remove(topic);
        Ok(())
    }
}
