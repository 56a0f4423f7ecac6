use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::{Ack, BusEvent, BusMessage, BusResult, SubscriptionId};

/// Receives messages from a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivery; call `ack.ack()` once it has been handled.
    async fn handle(&self, message: BusMessage, ack: Ack);
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(BusMessage, Ack) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: BusMessage, ack: Ack) {
        (self.0)(message, ack).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(BusMessage, Ack) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Topic-addressed publish/subscribe bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an event to a topic.
    async fn publish(&self, topic: &str, event: BusEvent) -> BusResult<()>;

    /// Attach a handler to a topic.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId>;

    /// Detach a handler previously attached with [`MessageBus::subscribe`].
    async fn unsubscribe(&self, topic: &str, id: &SubscriptionId) -> BusResult<()>;
}
