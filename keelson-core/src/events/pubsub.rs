use std::fmt;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info};

use super::{ClusterEvent, EventError, EventPublisher};

/// Publishes events as JSON on a Redis pub/sub channel.
#[derive(Clone)]
pub struct RedisEventPublisher {
    conn: ConnectionManager,
    channel: String,
}

impl fmt::Debug for RedisEventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventPublisher")
            .field("connection", &"ConnectionManager")
            .field("channel", &self.channel)
            .finish()
    }
}

impl RedisEventPublisher {
    pub async fn connect(
        redis_url: &str,
        channel: impl Into<String>,
    ) -> Result<Self, EventError> {
        let channel = channel.into();
        info!(channel = %channel, "connecting to Redis event channel");

        let client = redis::Client::open(redis_url).map_err(|e| {
            EventError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            EventError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })?;

        Ok(Self {
            conn,
            channel,
        })
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, event: ClusterEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| EventError::Unavailable(format!("Redis PUBLISH failed: {e}")))?;
        debug!(channel = %self.channel, receivers, kind = %event.kind, "published event");
        Ok(())
    }
}
