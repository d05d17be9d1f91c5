use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, RwLock};

use stride_core::bus::{BusMessage, EventBus};
use stride_core::error::Result;

/// In-process bus. Clones share topics, so services built on clones of
/// one bus see each other's broadcasts.
#[derive(Clone)]
pub struct MemoryEventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>,
    buffer_size: usize,
}

impl MemoryEventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            buffer_size: buffer_size.max(1),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for MemoryEventBus {
    fn publish(&self, topic: String, message: BusMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // No receivers is not an error
            let _ = self.sender(&topic).await.send(message);
            Ok(())
        })
    }

    fn subscribe(&self, topic: String) -> BoxFuture<'_, Result<broadcast::Receiver<BusMessage>>> {
        Box::pin(async move { Ok(self.sender(&topic).await.subscribe()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride_core::workflow::{EventKind, LifecycleEvent};

    fn message(origin: &str) -> BusMessage {
        BusMessage::new(origin, LifecycleEvent::new("checkout", "tx-1", EventKind::Begin))
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers() {
        let bus = MemoryEventBus::default();
        let mut checkout = bus.subscribe("stride:checkout".into()).await.unwrap();
        let mut refunds = bus.subscribe("stride:refunds".into()).await.unwrap();

        bus.publish("stride:checkout".into(), message("node-1"))
            .await
            .unwrap();

        assert_eq!(checkout.recv().await.unwrap().origin, "node-1");
        assert!(refunds.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_topics() {
        let bus = MemoryEventBus::new(8);
        let other = bus.clone();
        let mut rx = other.subscribe("t".into()).await.unwrap();

        bus.publish("t".into(), message("node-2")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().origin, "node-2");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryEventBus::default();
        assert!(bus.publish("nobody".into(), message("node-1")).await.is_ok());
    }
}
