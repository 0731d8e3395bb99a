//! Compensation log for multi-step provisioning.
//!
//! Each completed effect pushes its inverse. On failure the log is unwound in
//! reverse order; individual undo failures are logged and do not stop the
//! unwind.

use keelson_model::NodeId;
use tracing::{debug, warn};

use crate::runtime::{ContainerRef, ContainerRuntime, NetworkRef};
use crate::store::ClusterStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    RemoveContainer(ContainerRef),
    RemoveVolume(String),
    RemoveNetwork(NetworkRef),
    DeleteNode(NodeId),
}

#[derive(Debug, Default)]
pub struct Saga {
    steps: Vec<Compensation>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Takes over another saga's steps; they will be undone before any step
    /// recorded earlier in `self`.
    pub fn absorb(&mut self, other: Saga) {
        self.steps.extend(other.steps);
    }

    /// Forget the recorded steps once the effects are meant to stay.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Undo every recorded step, most recent first. Returns the number of undo
    /// steps that failed.
    pub async fn compensate(
        self,
        runtime: &dyn ContainerRuntime,
        store: &dyn ClusterStore,
    ) -> usize {
        let mut failures = 0;
        for step in self.steps.into_iter().rev() {
            debug!(?step, "compensating");
            let outcome = match &step {
                Compensation::RemoveContainer(container) => runtime
                    .remove_container(container)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::RemoveVolume(volume) => {
                    runtime.remove_volume(volume).await.map_err(|e| e.to_string())
                }
                Compensation::RemoveNetwork(network) => runtime
                    .remove_network(network)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::DeleteNode(node) => {
                    store.delete_node(*node).await.map_err(|e| e.to_string())
                }
            };
            if let Err(error) = outcome {
                failures += 1;
                warn!(?step, %error, "compensation step failed");
            }
        }
        failures
    }
}
