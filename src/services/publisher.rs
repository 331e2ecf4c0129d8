use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::models::event::CompletionEvent;

/// Fire-and-forget completion notifications.
///
/// Callers log and discard errors; a failed publish never fails the job.
#[async_trait]
pub trait CompletionPublisher: Send + Sync {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError>;
}

/// Publishes JSON events on a Redis pub/sub channel.
pub struct RedisPublisher {
    conn: MultiplexedConnection,
    channel: String,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl CompletionPublisher for RedisPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<CompletionEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl CompletionPublisher for BroadcastPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
