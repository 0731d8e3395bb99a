use keelson_model::{
    ClusterId, ClusterNode, InfrastructureStatus, NodeId, ProvisioningReport,
    ReplicaFailure, ReplicationMode, ScaleOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::ClusterOrchestrator;
use crate::error::{ClusterError, Result};
use crate::events::ClusterEventKind;
use crate::runtime::RuntimeError;

/// Replicas to remove when shrinking by `count`: highest ordinals first, never
/// the primary.
pub(crate) fn removal_candidates(
    nodes: &[ClusterNode],
    count: usize,
) -> Vec<&ClusterNode> {
    let mut replicas: Vec<&ClusterNode> =
        nodes.iter().filter(|n| n.is_replica()).collect();
    replicas.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
    replicas.truncate(count);
    replicas
}

impl ClusterOrchestrator {
    #[instrument(
        name = "orchestrator.scale_cluster",
        skip(self, cancel),
        fields(cluster_id = %id),
        err
    )]
    pub async fn scale_cluster(
        &self,
        id: ClusterId,
        desired: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleOutcome> {
        self.validate_node_count(desired)?;
        let (_guard, mut cluster, infra) = self.lock_and_load(id).await?;
        if infra.status != InfrastructureStatus::Running {
            return Err(ClusterError::InvalidState {
                cluster: id,
                status: infra.status,
                operation: "scale",
            });
        }

        let nodes = self.clusters.list_nodes(id).await?;
        let current = nodes.len() as u32;
        let mut outcome = ScaleOutcome {
            cluster_id: id,
            previous: current,
            desired,
            added: Vec::new(),
            removed: Vec::new(),
            removal_failures: Vec::new(),
            report: ProvisioningReport {
                requested: 0,
                provisioned: 0,
                failures: Vec::new(),
            },
        };
        if desired == current {
            return Ok(outcome);
        }

        if desired < current {
            let candidates =
                removal_candidates(&nodes, (current - desired) as usize);
            for node in candidates {
                match self.remove_replica(node).await {
                    Ok(()) => outcome.removed.push(node.id),
                    Err(error) => {
                        warn!(node = %node.name, %error, "failed to remove replica, skipping");
                        outcome.removal_failures.push(node.id);
                    }
                }
            }
            let remaining = current - outcome.removed.len() as u32;
            cluster.node_count = desired.max(remaining);
            self.clusters.update_cluster(&cluster).await?;

            if cluster.replication_mode == ReplicationMode::Sync {
                let survivors: Vec<&ClusterNode> = nodes
                    .iter()
                    .filter(|n| !outcome.removed.contains(&n.id))
                    .collect();
                if let Some(primary) = survivors.iter().find(|n| n.is_primary()) {
                    let standbys: Vec<String> = survivors
                        .iter()
                        .filter(|n| n.is_replica())
                        .map(|n| n.name.clone())
                        .collect();
                    self.apply_sync_policy(&cluster, primary, &standbys).await;
                }
            }
        } else {
            let primary = nodes
                .iter()
                .find(|n| n.is_primary())
                .ok_or(ClusterError::NoPrimary(id))?;

            cluster.node_count = cluster.node_count.max(desired);
            self.clusters.update_cluster(&cluster).await?;

            let to_add = desired - current;
            outcome.report.requested = to_add;
            let mut next_ordinal =
                nodes.iter().map(|n| n.ordinal).max().map_or(0, |o| o + 1);
            let mut attached: Vec<String> = nodes
                .iter()
                .filter(|n| n.is_replica())
                .map(|n| n.name.clone())
                .collect();
            for _ in 0..to_add {
                let ordinal = next_ordinal;
                next_ordinal += 1;
                if cancel.is_cancelled() {
                    outcome.report.failures.push(ReplicaFailure {
                        ordinal,
                        reason: "cancelled".to_string(),
                    });
                    continue;
                }
                match self.provision_replica(&cluster, primary, ordinal, cancel).await {
                    Ok((node, steps)) => {
                        steps.commit();
                        outcome.report.provisioned += 1;
                        outcome.added.push(node.id);
                        attached.push(node.name);
                    }
                    Err(error) => {
                        warn!(cluster_id = %id, ordinal, %error, "replica provisioning failed during scale-up");
                        outcome.report.failures.push(ReplicaFailure {
                            ordinal,
                            reason: error.to_string(),
                        });
                    }
                }
            }

            if cluster.replication_mode == ReplicationMode::Sync && !outcome.added.is_empty() {
                self.apply_sync_policy(&cluster, primary, &attached).await;
            }
        }

        let added: Vec<String> = outcome.added.iter().map(NodeId::to_string).collect();
        let removed: Vec<String> =
            outcome.removed.iter().map(NodeId::to_string).collect();
        self.events
            .emit(
                self.event(&cluster, ClusterEventKind::Scaled)
                    .with("previous", outcome.previous)
                    .with("desired", desired)
                    .with("added", added)
                    .with("removed", removed),
            )
            .await;
        info!(
            cluster_id = %id,
            previous = outcome.previous,
            desired,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "cluster scaled"
        );
        Ok(outcome)
    }

    /// Stop, remove container, remove volume, delete record. The container
    /// being already gone is not an error.
    async fn remove_replica(&self, node: &ClusterNode) -> Result<()> {
        let container = Self::container_of(node);
        match self.runtime.stop_container(&container).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        match self.runtime.remove_container(&container).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        self.runtime.remove_volume(&node.volume).await?;
        self.clusters.delete_node(node.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keelson_model::NodeRole;

    use super::*;

    fn node(ordinal: u32, role: NodeRole) -> ClusterNode {
        let now = Utc::now();
        ClusterNode {
            id: NodeId::new(),
            cluster_id: ClusterId::new(),
            ordinal,
            name: format!("pg-{ordinal}"),
            container_id: format!("c{ordinal}"),
            role,
            port: 5432,
            volume: format!("v{ordinal}"),
            healthy: true,
            replication_lag_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn removal_never_selects_the_primary() {
        let nodes = vec![
            node(0, NodeRole::Replica),
            node(1, NodeRole::Replica),
            node(2, NodeRole::Primary),
        ];
        let picked: Vec<u32> = removal_candidates(&nodes, 5)
            .iter()
            .map(|n| n.ordinal)
            .collect();
        assert_eq!(picked, vec![1, 0]);
    }

    #[test]
    fn removal_prefers_highest_ordinals() {
        let nodes = vec![
            node(0, NodeRole::Primary),
            node(1, NodeRole::Replica),
            node(2, NodeRole::Replica),
            node(3, NodeRole::Replica),
        ];
        let picked: Vec<u32> = removal_candidates(&nodes, 2)
            .iter()
            .map(|n| n.ordinal)
            .collect();
        assert_eq!(picked, vec![3, 2]);
    }
}
