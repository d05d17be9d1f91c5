use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use stride_core::bus::{BusMessage, EventBus};
use stride_core::config::BusConfig;
use stride_core::error::{Result, StrideError};

/// PostgreSQL bus configuration.
#[derive(Debug, Clone)]
pub struct PgEventBusConfig {
    /// NOTIFY channel shared by all topics.
    pub channel: String,
    /// Buffer size of the per-topic local broadcast.
    pub buffer_size: usize,
}

impl Default for PgEventBusConfig {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for PgEventBusConfig {
    fn from(config: &BusConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            buffer_size: config.buffer_size.max(1),
        }
    }
}

/// Wire format of a notification.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    message: BusMessage,
}

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

/// Bus over PostgreSQL LISTEN/NOTIFY.
///
/// All topics travel on one channel. A single listener connection per
/// process is opened on the first subscription and fans notifications out
/// to local per-topic broadcasts. NOTIFY payloads are limited to 8000 bytes
/// by PostgreSQL, so very large step responses fail to publish.
#[derive(Clone)]
pub struct PgEventBus {
    pool: PgPool,
    config: PgEventBusConfig,
    topics: Topics,
    listening: Arc<Mutex<bool>>,
    shutdown: CancellationToken,
}

impl PgEventBus {
    pub fn new(pool: PgPool, config: PgEventBusConfig) -> Self {
        Self {
            pool,
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            listening: Arc::new(Mutex::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the listener task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn ensure_listening(&self) -> Result<()> {
        let mut listening = self.listening.lock().await;
        if *listening {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StrideError::Bus(format!("Failed to connect listener: {}", e)))?;
        listener
            .listen(&self.config.channel)
            .await
            .map_err(|e| StrideError::Bus(format!("Failed to listen: {}", e)))?;

        tracing::info!(channel = %self.config.channel, "Listening for lifecycle broadcasts");

        let topics = self.topics.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(notification) => dispatch(&topics, notification.payload()).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "Error receiving notification");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Event bus listener shutting down");
                        break;
                    }
                }
            }
        });

        *listening = true;
        Ok(())
    }

    async fn local_sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.buffer_size).0)
            .clone()
    }
}

async fn dispatch(topics: &Topics, payload: &str) {
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid lifecycle broadcast");
            return;
        }
    };

    if let Some(sender) = topics.read().await.get(&envelope.topic) {
        let _ = sender.send(envelope.message);
    }
}

impl EventBus for PgEventBus {
    fn publish(&self, topic: String, message: BusMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&Envelope { topic, message })?;

            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&self.config.channel)
                .bind(&payload)
                .execute(&self.pool)
                .await
                .map_err(|e| StrideError::Bus(format!("Failed to publish: {}", e)))?;
            Ok(())
        })
    }

    fn subscribe(&self, topic: String) -> BoxFuture<'_, Result<broadcast::Receiver<BusMessage>>> {
        Box::pin(async move {
            let receiver = self.local_sender(&topic).await.subscribe();
            self.ensure_listening().await?;
            Ok(receiver)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride_core::workflow::{EventKind, LifecycleEvent};

    #[test]
    fn test_config_from_bus_config() {
        let config = PgEventBusConfig::default();
        assert_eq!(config.channel, "stride_events");
        assert_eq!(config.buffer_size, 1024);
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_topic() {
        let topics: Topics = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = broadcast::channel(4);
        topics.write().await.insert("stride:checkout".into(), tx);

        let envelope = Envelope {
            topic: "stride:checkout".into(),
            message: BusMessage::new(
                "node-1",
                LifecycleEvent::new("checkout", "tx-1", EventKind::Begin),
            ),
        };
        dispatch(&topics, &serde_json::to_string(&envelope).unwrap()).await;
        assert_eq!(rx.recv().await.unwrap().origin, "node-1");

        let other = Envelope {
            topic: "stride:refunds".into(),
            message: envelope.message.clone(),
        };
        dispatch(&topics, &serde_json::to_string(&other).unwrap()).await;
        dispatch(&topics, "not json").await;
        assert!(rx.try_recv().is_err());
    }
}
