use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use workflow_types::{WatchEvent, WorkflowEvent};

use crate::{BusError, BusResult};

/// Identifier of one subscription
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything that travels over the bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "lowercase")]
pub enum BusEvent {
    Lifecycle(WorkflowEvent),
    Watch(WatchEvent),
}

impl BusEvent {
    pub fn run_id(&self) -> &str {
        match self {
            BusEvent::Lifecycle(event) => &event.run_id,
            BusEvent::Watch(event) => event.run_id(),
        }
    }
}

impl From<WorkflowEvent> for BusEvent {
    fn from(event: WorkflowEvent) -> Self {
        BusEvent::Lifecycle(event)
    }
}

impl From<WatchEvent> for BusEvent {
    fn from(event: WatchEvent) -> Self {
        BusEvent::Watch(event)
    }
}

/// A message as delivered to a subscriber
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub id: String,
    pub topic: String,
    pub payload: BusEvent,
    pub published_at: DateTime<Utc>,
    /// 0 on first delivery, incremented on every redelivery
    pub delivery_attempt: u32,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: BusEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
            delivery_attempt: 0,
        }
    }

    /// The same message, marked as delivered once more
    pub fn redelivered(mut self) -> Self {
        self.delivery_attempt += 1;
        self
    }
}

/// Acknowledgement handle for one delivery
///
/// Dropping it without calling [`Ack::ack`] asks the bus to redeliver.
#[derive(Debug)]
pub struct Ack {
    message_id: String,
    tx: oneshot::Sender<()>,
}

impl Ack {
    /// Create an ack handle and the receiver the bus waits on
    pub fn channel(message_id: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message_id: message_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Confirm the message was processed
    pub fn ack(self) -> BusResult<()> {
        self.tx
            .send(())
            .map_err(|_| BusError::AckFailed(self.message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{CancelData, LifecycleEvent};

    fn cancel_event() -> BusEvent {
        WorkflowEvent::new(
            "run-1",
            LifecycleEvent::Cancel(CancelData {
                workflow_id: "wf".into(),
            }),
        )
        .into()
    }

    #[test]
    fn test_ack_reaches_receiver() {
        let (ack, mut rx) = Ack::channel("m1");
        ack.ack().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_ack_fails_without_receiver() {
        let (ack, rx) = Ack::channel("m1");
        drop(rx);
        assert!(matches!(ack.ack(), Err(BusError::AckFailed(id)) if id == "m1"));
    }

    #[test]
    fn test_redelivery_counts() {
        let message = BusMessage::new("workflows", cancel_event());
        let again = message.clone().redelivered().redelivered();
        assert_eq!(again.id, message.id);
        assert_eq!(again.delivery_attempt, 2);
        assert_eq!(again.payload.run_id(), "run-1");
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(BusMessage::new("workflows", cancel_event())).unwrap();
        assert_eq!(value["payload"]["kind"], "lifecycle");
        assert_eq!(value["payload"]["event"]["event"]["type"], "workflow.cancel");
    }
}
