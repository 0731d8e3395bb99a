use std::collections::HashMap;

use chrono::Utc;
use futures::future::join_all;
use keelson_model::{
    ClusterId, ClusterInfo, ClusterLogs, ClusterNode, ClusterStats, LagSource,
    NodeInfo, NodeLog, NodeStats, ReplicaStatus, ReplicationStatus,
};
use tracing::{debug, instrument, warn};

use super::ClusterOrchestrator;
use super::commands::{self, ReplicationRow};
use crate::error::Result;

const UNKNOWN_STATUS: &str = "unknown";
const DISCONNECTED: &str = "disconnected";

/// Joins the live replication view with the replica records by
/// `application_name` (the node name).
pub(crate) fn merge_replication_view(
    replicas: &[&ClusterNode],
    rows: &[ReplicationRow],
) -> Vec<ReplicaStatus> {
    let by_name: HashMap<&str, &ReplicationRow> = rows
        .iter()
        .map(|row| (row.application_name.as_str(), row))
        .collect();
    replicas
        .iter()
        .map(|node| match by_name.get(node.name.as_str()) {
            Some(row) => ReplicaStatus {
                node_id: node.id,
                node_name: node.name.clone(),
                state: row.state.clone(),
                sync_state: row.sync_state.clone(),
                lag_bytes: row.lag_bytes,
                lag_seconds: row.lag_seconds,
                is_healthy: row.state == "streaming",
            },
            None => ReplicaStatus {
                node_id: node.id,
                node_name: node.name.clone(),
                state: DISCONNECTED.to_string(),
                sync_state: String::new(),
                lag_bytes: node.replication_lag_bytes,
                lag_seconds: 0.0,
                is_healthy: false,
            },
        })
        .collect()
}

fn stored_replica_status(node: &ClusterNode) -> ReplicaStatus {
    ReplicaStatus {
        node_id: node.id,
        node_name: node.name.clone(),
        state: UNKNOWN_STATUS.to_string(),
        sync_state: String::new(),
        lag_bytes: node.replication_lag_bytes,
        lag_seconds: 0.0,
        is_healthy: node.healthy,
    }
}

impl ClusterOrchestrator {
    #[instrument(name = "orchestrator.get_cluster_info", skip(self), level = "debug", err)]
    pub async fn get_cluster_info(&self, id: ClusterId) -> Result<ClusterInfo> {
        let (cluster, infra) = self.load(id).await?;
        let nodes = self.clusters.list_nodes(id).await?;

        let states = join_all(nodes.iter().map(|node| async move {
            match self
                .runtime
                .inspect_container(&Self::container_of(node))
                .await
            {
                Ok(state) => state.status,
                Err(error) => {
                    debug!(node = %node.name, %error, "inspect failed");
                    UNKNOWN_STATUS.to_string()
                }
            }
        }))
        .await;

        let infos: Vec<NodeInfo> = nodes
            .iter()
            .zip(states)
            .map(|(node, status)| NodeInfo {
                node_id: node.id,
                node_name: node.name.clone(),
                container_id: node.container_id.clone(),
                role: node.role,
                port: node.port,
                status,
                replication_lag_bytes: node.replication_lag_bytes,
                is_healthy: node.healthy,
            })
            .collect();
        let primary_port = nodes.iter().find(|n| n.is_primary()).map(|n| n.port);

        Ok(ClusterInfo {
            cluster_id: cluster.id,
            infrastructure_id: cluster.infrastructure_id,
            cluster_name: cluster.name,
            postgres_version: cluster.version,
            status: infra.status,
            replication_mode: cluster.replication_mode,
            node_count: cluster.node_count,
            primary_node_id: cluster.primary_node_id,
            primary_port,
            nodes: infos,
            created_at: cluster.created_at,
            updated_at: cluster.updated_at,
        })
    }

    /// Live `pg_stat_replication` on the primary, falling back to the stored
    /// values when the primary cannot be queried.
    #[instrument(name = "orchestrator.get_replication_status", skip(self), level = "debug", err)]
    pub async fn get_replication_status(
        &self,
        id: ClusterId,
    ) -> Result<ReplicationStatus> {
        let (cluster, _infra) = self.load(id).await?;
        let nodes = self.clusters.list_nodes(id).await?;

        let Some(primary) = nodes.iter().find(|n| n.is_primary()) else {
            return Ok(ReplicationStatus {
                cluster_id: id,
                primary: None,
                primary_name: None,
                source: LagSource::Live,
                replicas: Vec::new(),
            });
        };
        let replicas: Vec<&ClusterNode> =
            nodes.iter().filter(|n| n.is_replica()).collect();

        let argv = commands::psql(
            &cluster.credentials.admin_user,
            &[commands::REPLICATION_VIEW],
        );
        let live = self
            .exec_step(&primary.name, &Self::container_of(primary), "replication_status", &argv)
            .await;

        let (source, statuses) = match live {
            Ok(output) => {
                let rows = commands::parse_replication_rows(&output.stdout);
                let statuses = merge_replication_view(&replicas, &rows);
                self.record_replication(&replicas, &statuses).await;
                (LagSource::Live, statuses)
            }
            Err(error) => {
                warn!(cluster_id = %id, %error, "live replication query failed, using stored values");
                (
                    LagSource::Stored,
                    replicas.iter().map(|n| stored_replica_status(n)).collect(),
                )
            }
        };

        Ok(ReplicationStatus {
            cluster_id: id,
            primary: Some(primary.id),
            primary_name: Some(primary.name.clone()),
            source,
            replicas: statuses,
        })
    }

    /// Writes polled lag and health back to the node records.
    async fn record_replication(
        &self,
        replicas: &[&ClusterNode],
        statuses: &[ReplicaStatus],
    ) {
        for (node, status) in replicas.iter().zip(statuses) {
            if node.healthy == status.is_healthy
                && node.replication_lag_bytes == status.lag_bytes
            {
                continue;
            }
            let mut updated = (*node).clone();
            updated.healthy = status.is_healthy;
            updated.replication_lag_bytes = status.lag_bytes;
            if let Err(error) = self.clusters.update_node(&updated).await {
                warn!(node = %node.name, %error, "failed to record replication status");
            }
        }
    }

    #[instrument(name = "orchestrator.get_cluster_stats", skip(self), level = "debug", err)]
    pub async fn get_cluster_stats(&self, id: ClusterId) -> Result<ClusterStats> {
        let (cluster, _infra) = self.load(id).await?;
        let nodes = self.clusters.list_nodes(id).await?;
        let connections_argv = commands::psql(
            &cluster.credentials.admin_user,
            &[commands::ACTIVE_CONNECTIONS],
        );
        let connections_argv = &connections_argv;

        let collected = join_all(nodes.iter().map(|node| async move {
            let container = Self::container_of(node);
            let stats = match self.runtime.container_stats(&container).await {
                Ok(stats) => stats,
                Err(error) => {
                    debug!(node = %node.name, %error, "stats unavailable, skipping node");
                    return None;
                }
            };
            let active_connections = match self.runtime.exec(&container, connections_argv).await {
                Ok(output) if output.success() => output.stdout.trim().parse::<u32>().ok(),
                _ => None,
            };
            Some(NodeStats {
                node_id: node.id,
                node_name: node.name.clone(),
                role: node.role,
                cpu_percent: stats.cpu_percent,
                memory_percent: stats.memory_percent,
                memory_usage_bytes: stats.memory_usage_bytes,
                active_connections,
            })
        }))
        .await;
        let node_stats: Vec<NodeStats> = collected.into_iter().flatten().collect();

        let total_connections = node_stats
            .iter()
            .filter_map(|s| s.active_connections)
            .sum();
        let total_memory_bytes = node_stats.iter().map(|s| s.memory_usage_bytes).sum();
        let average_cpu_percent = if node_stats.is_empty() {
            0.0
        } else {
            node_stats.iter().map(|s| s.cpu_percent).sum::<f64>()
                / node_stats.len() as f64
        };

        Ok(ClusterStats {
            cluster_id: id,
            total_connections,
            total_memory_bytes,
            average_cpu_percent,
            nodes: node_stats,
        })
    }

    #[instrument(name = "orchestrator.get_cluster_logs", skip(self), level = "debug", err)]
    pub async fn get_cluster_logs(
        &self,
        id: ClusterId,
        tail: Option<usize>,
    ) -> Result<ClusterLogs> {
        let (_cluster, _infra) = self.load(id).await?;
        let nodes = self.clusters.list_nodes(id).await?;
        let tail = tail.unwrap_or(self.config.default_log_tail);

        let collected = join_all(nodes.iter().map(|node| async move {
            match self
                .runtime
                .container_logs(&Self::container_of(node), tail)
                .await
            {
                Ok(lines) => Some(NodeLog {
                    node_id: node.id,
                    node_name: node.name.clone(),
                    role: node.role,
                    collected_at: Utc::now(),
                    lines,
                }),
                Err(error) => {
                    debug!(node = %node.name, %error, "logs unavailable, skipping node");
                    None
                }
            }
        }))
        .await;

        Ok(ClusterLogs {
            cluster_id: id,
            logs: collected.into_iter().flatten().collect(),
        })
    }
}
