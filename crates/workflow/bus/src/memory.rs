//! In-memory message bus for development and testing.
//!
//! Each subscription owns an unbounded channel drained by its own task.
//! Queue topics spawn one task per delivery so a worker can process many
//! runs concurrently; fan-out topics are handled one message at a time so
//! subscribers observe publish order.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use workflow_types::WORKFLOWS_TOPIC;

use crate::{
    Ack, BusError, BusEvent, BusMessage, BusResult, EventHandler, MessageBus, SubscriptionId,
};

/// Configuration for [`InMemoryBus`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryBusConfig {
    /// Redeliveries of a message whose ack was dropped
    pub max_redeliveries: u32,
    /// Topics delivered to one subscriber per message
    pub queue_topics: Vec<String>,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            queue_topics: vec![WORKFLOWS_TOPIC.to_string()],
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

struct Inner {
    config: InMemoryBusConfig,
    topics: DashMap<String, TopicState>,
}

impl Inner {
    fn is_queue(&self, topic: &str) -> bool {
        self.config.queue_topics.iter().any(|t| t == topic)
    }

    fn dispatch(&self, message: BusMessage) {
        let queue = self.is_queue(&message.topic);
        let Some(mut state) = self.topics.get_mut(&message.topic) else {
            tracing::debug!(topic = %message.topic, "No subscribers, message dropped");
            return;
        };

        if queue {
            // round-robin over live subscribers, pruning closed ones
            while !state.subscribers.is_empty() {
                let index = state.cursor % state.subscribers.len();
                if state.subscribers[index].tx.send(message.clone()).is_ok() {
                    state.cursor = index + 1;
                    return;
                }
                state.subscribers.remove(index);
            }
            tracing::debug!(topic = %message.topic, "No live subscribers, message dropped");
        } else {
            state
                .subscribers
                .retain(|subscriber| subscriber.tx.send(message.clone()).is_ok());
        }
    }

    async fn deliver(inner: Weak<Inner>, handler: Arc<dyn EventHandler>, message: BusMessage) {
        let (ack, acked) = Ack::channel(message.id.clone());
        handler.handle(message.clone(), ack).await;
        if acked.await.is_ok() {
            return;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if message.delivery_attempt < inner.config.max_redeliveries {
            tracing::warn!(
                topic = %message.topic,
                message_id = %message.id,
                attempt = message.delivery_attempt + 1,
                "Message not acknowledged, redelivering"
            );
            inner.dispatch(message.redelivered());
        } else {
            tracing::error!(
                topic = %message.topic,
                message_id = %message.id,
                "Message not acknowledged after max redeliveries, dropping"
            );
        }
    }
}

/// In-memory implementation of [`MessageBus`]
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new(config: InMemoryBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: DashMap::new(),
            }),
        }
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map_or(0, |state| state.subscribers.len())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(InMemoryBusConfig::default())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, event: BusEvent) -> BusResult<()> {
        self.inner.dispatch(BusMessage::new(topic, event));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        let id = SubscriptionId::generate();
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(Subscriber { id: id.clone(), tx });

        let queue = self.inner.is_queue(topic);
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if queue {
                    tokio::spawn(Inner::deliver(inner.clone(), handler.clone(), message));
                } else {
                    Inner::deliver(inner.clone(), handler.clone(), message).await;
                }
            }
        });

        tracing::debug!(topic = %topic, subscription = %id, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: &SubscriptionId) -> BusResult<()> {
        let mut state = self
            .inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::NotSubscribed {
                topic: topic.to_string(),
                id: id.to_string(),
            })?;
        let before = state.subscribers.len();
        state.subscribers.retain(|subscriber| &subscriber.id != id);
        if state.subscribers.len() == before {
            return Err(BusError::NotSubscribed {
                topic: topic.to_string(),
                id: id.to_string(),
            });
        }
        tracing::debug!(topic = %topic, subscription = %id, "Unsubscribed");
        Ok(())
    }
}
