//! Cross-instance broadcast of lifecycle events.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::workflow::LifecycleEvent;

/// A lifecycle event stamped with the instance that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub origin: String,
    pub event: LifecycleEvent,
}

impl BusMessage {
    pub fn new(origin: impl Into<String>, event: LifecycleEvent) -> Self {
        Self {
            origin: origin.into(),
            event,
        }
    }
}

/// Topic-based pub/sub shared by all orchestrator instances.
pub trait EventBus: Send + Sync + 'static {
    /// Publish a message to every subscriber of `topic`, including ones in this process.
    fn publish(&self, topic: String, message: BusMessage) -> BoxFuture<'_, Result<()>>;

    /// Receive messages published to `topic` from now on.
    fn subscribe(&self, topic: String) -> BoxFuture<'_, Result<broadcast::Receiver<BusMessage>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::EventKind;

    #[test]
    fn test_bus_message_wire_shape() {
        let message = BusMessage::new(
            "node-1",
            LifecycleEvent::new("checkout", "tx-1", EventKind::Begin),
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["origin"], "node-1");
        assert_eq!(value["event"]["eventType"], "begin");

        let parsed: BusMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }
}
