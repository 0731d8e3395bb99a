use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ClusterEvent, EventError, EventPublisher};

/// In-process fan-out of cluster events to any number of observers.
#[derive(Debug)]
pub struct InProcEventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: ClusterEvent) -> Result<(), EventError> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}
