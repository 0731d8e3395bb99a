//! Cluster lifecycle notifications.
//!
//! Events are fire-and-forget: [`EventNotifier`] bounds every publish with a
//! timeout and only logs failures, so a slow or broken sink never fails the
//! operation that produced the event.

pub mod bus;
#[cfg(feature = "database")]
pub mod pubsub;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keelson_model::{ClusterId, InfrastructureId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use bus::InProcEventBus;
#[cfg(feature = "database")]
pub use pubsub::RedisEventPublisher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterEventKind {
    #[serde(rename = "cluster.created")]
    Created,
    #[serde(rename = "cluster.started")]
    Started,
    #[serde(rename = "cluster.stopped")]
    Stopped,
    #[serde(rename = "cluster.deleted")]
    Deleted,
    #[serde(rename = "cluster.scaled")]
    Scaled,
    #[serde(rename = "cluster.failover")]
    Failover,
    #[serde(rename = "cluster.failed")]
    Failed,
}

impl ClusterEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterEventKind::Created => "cluster.created",
            ClusterEventKind::Started => "cluster.started",
            ClusterEventKind::Stopped => "cluster.stopped",
            ClusterEventKind::Deleted => "cluster.deleted",
            ClusterEventKind::Scaled => "cluster.scaled",
            ClusterEventKind::Failover => "cluster.failover",
            ClusterEventKind::Failed => "cluster.failed",
        }
    }
}

impl fmt::Display for ClusterEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification describing a cluster transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_id: Uuid,
    pub cluster_id: ClusterId,
    pub infrastructure_id: InfrastructureId,
    pub kind: ClusterEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ClusterEvent {
    pub fn new(
        cluster_id: ClusterId,
        infrastructure_id: InfrastructureId,
        kind: ClusterEventKind,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            cluster_id,
            infrastructure_id,
            kind,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ClusterEvent) -> Result<(), EventError>;
}

/// Sink that only writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl EventPublisher for LoggingPublisher {
    async fn publish(&self, event: ClusterEvent) -> Result<(), EventError> {
        let metadata = Value::Object(event.metadata);
        info!(
            cluster_id = %event.cluster_id,
            kind = %event.kind,
            metadata = %metadata,
            "cluster event"
        );
        Ok(())
    }
}

/// Best-effort emission front for an [`EventPublisher`].
#[derive(Clone)]
pub struct EventNotifier {
    publisher: Arc<dyn EventPublisher>,
    timeout: Duration,
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EventNotifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    pub async fn emit(&self, event: ClusterEvent) {
        let kind = event.kind;
        let cluster_id = event.cluster_id;
        match tokio::time::timeout(self.timeout, self.publisher.publish(event))
            .await
        {
            Ok(Ok(())) => debug!(%cluster_id, %kind, "event published"),
            Ok(Err(error)) => {
                warn!(%cluster_id, %kind, %error, "failed to publish event")
            }
            Err(_) => warn!(
                %cluster_id,
                %kind,
                timeout = ?self.timeout,
                "event publish timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl EventPublisher for Stalled {
        async fn publish(&self, _event: ClusterEvent) -> Result<(), EventError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl EventPublisher for Broken {
        async fn publish(&self, _event: ClusterEvent) -> Result<(), EventError> {
            Err(EventError::Unavailable("down".into()))
        }
    }

    fn event() -> ClusterEvent {
        ClusterEvent::new(
            ClusterId::new(),
            InfrastructureId::new(),
            ClusterEventKind::Created,
        )
        .with("requested", 3)
    }

    #[test]
    fn kind_serializes_as_dotted_name() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["kind"], "cluster.created");
        assert_eq!(json["metadata"]["requested"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_gives_up_on_stalled_publisher() {
        let notifier =
            EventNotifier::new(Arc::new(Stalled), Duration::from_millis(50));
        notifier.emit(event()).await;
    }

    #[tokio::test]
    async fn logging_publisher_renders_metadata() {
        LoggingPublisher
            .publish(event().with("nodes", vec!["pg-0", "pg-1"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notifier_swallows_publisher_errors() {
        let notifier = EventNotifier::new(Arc::new(Broken), Duration::from_secs(1));
        notifier.emit(event()).await;
    }
}
