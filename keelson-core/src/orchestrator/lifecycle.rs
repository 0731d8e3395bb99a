use keelson_model::{
    Cluster, ClusterId, ClusterNode, InfrastructureStatus, NodeId,
    TransitionReport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::ClusterOrchestrator;
use super::readiness;
use crate::error::{ClusterError, Result};
use crate::events::ClusterEventKind;
use crate::runtime::{NetworkRef, RuntimeError};

/// Replicas by descending ordinal, then the primary.
pub(crate) fn stop_order(nodes: &[ClusterNode]) -> Vec<&ClusterNode> {
    let mut replicas: Vec<&ClusterNode> =
        nodes.iter().filter(|n| n.is_replica()).collect();
    replicas.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
    replicas.extend(nodes.iter().filter(|n| n.is_primary()));
    replicas
}

fn ensure_not_deleting(
    cluster: &Cluster,
    status: InfrastructureStatus,
    operation: &'static str,
) -> Result<()> {
    if matches!(
        status,
        InfrastructureStatus::Deleting | InfrastructureStatus::Deleted
    ) {
        return Err(ClusterError::InvalidState {
            cluster: cluster.id,
            status,
            operation,
        });
    }
    Ok(())
}

fn cancelled(cancel: &CancellationToken, what: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ClusterError::Cancelled(what.to_string()));
    }
    Ok(())
}

impl ClusterOrchestrator {
    /// Stops every node in [`stop_order`]; returns the nodes that failed.
    async fn stop_nodes(&self, nodes: &[ClusterNode]) -> Vec<NodeId> {
        let mut failed = Vec::new();
        for node in stop_order(nodes) {
            match self
                .runtime
                .stop_container(&Self::container_of(node))
                .await
            {
                Ok(()) => debug!(node = %node.name, "node stopped"),
                Err(error) => {
                    warn!(node = %node.name, %error, "failed to stop node");
                    failed.push(node.id);
                }
            }
        }
        failed
    }

    async fn stop_locked(&self, cluster: &Cluster) -> Result<TransitionReport> {
        let nodes = self.clusters.list_nodes(cluster.id).await?;
        let failed_nodes = self.stop_nodes(&nodes).await;

        self.set_status(cluster, InfrastructureStatus::Stopped).await?;
        self.events
            .emit(
                self.event(cluster, ClusterEventKind::Stopped)
                    .with("status", InfrastructureStatus::Stopped.as_str())
                    .with("failed_nodes", failed_nodes.len()),
            )
            .await;
        info!(cluster_id = %cluster.id, failed = failed_nodes.len(), "cluster stopped");
        Ok(TransitionReport {
            status: Some(InfrastructureStatus::Stopped),
            failed_nodes,
        })
    }

    /// Primary first (fatal), readiness, then replicas (best-effort).
    async fn start_locked(
        &self,
        cluster: &Cluster,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        let nodes = self.clusters.list_nodes(cluster.id).await?;
        let primary = nodes
            .iter()
            .find(|n| n.is_primary())
            .ok_or(ClusterError::NoPrimary(cluster.id))?;

        let container = Self::container_of(primary);
        self.runtime.start_container(&container).await?;
        self.wait_ready(&primary.name, &container, cancel).await?;

        let mut failed_nodes = Vec::new();
        let mut replicas: Vec<&ClusterNode> =
            nodes.iter().filter(|n| n.is_replica()).collect();
        replicas.sort_by_key(|n| n.ordinal);
        for replica in replicas {
            if let Err(error) = self
                .runtime
                .start_container(&Self::container_of(replica))
                .await
            {
                warn!(node = %replica.name, %error, "failed to start replica");
                failed_nodes.push(replica.id);
            }
        }

        self.set_status(cluster, InfrastructureStatus::Running).await?;
        self.events
            .emit(
                self.event(cluster, ClusterEventKind::Started)
                    .with("status", InfrastructureStatus::Running.as_str())
                    .with("failed_nodes", failed_nodes.len()),
            )
            .await;
        info!(cluster_id = %cluster.id, failed = failed_nodes.len(), "cluster started");
        Ok(TransitionReport {
            status: Some(InfrastructureStatus::Running),
            failed_nodes,
        })
    }

    #[instrument(name = "orchestrator.stop_cluster", skip(self, cancel), fields(cluster_id = %id), err)]
    pub async fn stop_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        let (_guard, cluster, infra) = self.lock_and_load(id).await?;
        ensure_not_deleting(&cluster, infra.status, "stop")?;
        cancelled(cancel, "stop cluster")?;
        self.stop_locked(&cluster).await
    }

    #[instrument(name = "orchestrator.start_cluster", skip(self, cancel), fields(cluster_id = %id), err)]
    pub async fn start_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        let (_guard, cluster, infra) = self.lock_and_load(id).await?;
        if infra.status == InfrastructureStatus::Running {
            return Err(ClusterError::AlreadyRunning(id));
        }
        ensure_not_deleting(&cluster, infra.status, "start")?;
        cancelled(cancel, "start cluster")?;
        self.start_locked(&cluster, cancel).await
    }

    #[instrument(name = "orchestrator.restart_cluster", skip(self, cancel), fields(cluster_id = %id), err)]
    pub async fn restart_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        let (_guard, cluster, infra) = self.lock_and_load(id).await?;
        ensure_not_deleting(&cluster, infra.status, "restart")?;
        cancelled(cancel, "restart cluster")?;

        let stopped = self.stop_locked(&cluster).await?;
        readiness::settle(self.config.restart_settle, cancel).await?;
        let started = self.start_locked(&cluster, cancel).await?;
        Ok(stopped.merge(started))
    }

    #[instrument(name = "orchestrator.delete_cluster", skip(self, _cancel), fields(cluster_id = %id), err)]
    pub async fn delete_cluster(
        &self,
        id: ClusterId,
        _cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        let (guard, cluster, _infra) = self.lock_and_load(id).await?;

        self.set_status(&cluster, InfrastructureStatus::Deleting).await?;
        let nodes = self.clusters.list_nodes(id).await?;
        let mut failed_nodes = self.stop_nodes(&nodes).await;
        if !failed_nodes.is_empty() {
            warn!(cluster_id = %id, failed = failed_nodes.len(), "nodes failed to stop before removal");
        }

        for node in stop_order(&nodes) {
            match self
                .runtime
                .remove_container(&Self::container_of(node))
                .await
            {
                Ok(()) => {}
                // Already gone, so a failed stop does not count either.
                Err(RuntimeError::NotFound(_)) => failed_nodes.retain(|n| *n != node.id),
                Err(error) => {
                    warn!(node = %node.name, %error, "failed to remove container");
                    if !failed_nodes.contains(&node.id) {
                        failed_nodes.push(node.id);
                    }
                }
            }
            if let Err(error) = self.runtime.remove_volume(&node.volume).await {
                warn!(node = %node.name, volume = %node.volume, %error, "failed to remove volume");
            }
            self.clusters.delete_node(node.id).await?;
        }

        if let Some(network_id) = &cluster.network_id {
            match self
                .runtime
                .remove_network(&NetworkRef(network_id.clone()))
                .await
            {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(error) => {
                    warn!(cluster_id = %id, network = %network_id, %error, "failed to remove network")
                }
            }
        }

        self.clusters.delete_cluster(id).await?;
        self.set_status(&cluster, InfrastructureStatus::Deleted).await?;
        drop(guard);
        self.locks.forget(id);

        self.events
            .emit(
                self.event(&cluster, ClusterEventKind::Deleted)
                    .with("status", InfrastructureStatus::Deleted.as_str()),
            )
            .await;
        info!(cluster_id = %id, "cluster deleted");
        Ok(TransitionReport {
            status: Some(InfrastructureStatus::Deleted),
            failed_nodes,
        })
    }
}
