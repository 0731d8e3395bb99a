//! Request and response payloads exposed by the cluster service.

use chrono::{DateTime, Utc};

use crate::cluster::{NodeRole, ReplicationMode};
use crate::ids::{ClusterId, InfrastructureId, NodeId};
use crate::infrastructure::InfrastructureStatus;

/// Request for a new replicated PostgreSQL cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CreateClusterRequest {
    pub cluster_name: String,
    pub postgres_version: String,
    pub node_count: u32,
    /// Thousandths of a CPU core per node; zero leaves the node unlimited.
    #[cfg_attr(feature = "serde", serde(default))]
    pub cpu_per_node: i64,
    /// Bytes of memory per node; zero leaves the node unlimited.
    #[cfg_attr(feature = "serde", serde(default))]
    pub memory_per_node: i64,
    pub postgres_password: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub replication_mode: ReplicationMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_name: String,
    pub container_id: String,
    pub role: NodeRole,
    pub port: u16,
    /// Live container state as reported by the runtime, `unknown` when the
    /// runtime could not be asked.
    pub status: String,
    pub replication_lag_bytes: i64,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterInfo {
    pub cluster_id: ClusterId,
    pub infrastructure_id: InfrastructureId,
    pub cluster_name: String,
    pub postgres_version: String,
    pub status: InfrastructureStatus,
    pub replication_mode: ReplicationMode,
    pub node_count: u32,
    pub primary_node_id: Option<NodeId>,
    /// Host port of the primary, the entry point for writes.
    pub primary_port: Option<u16>,
    pub nodes: Vec<NodeInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterInfo {
    pub fn primaries(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Replica)
    }
}

/// A replica that could not be provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicaFailure {
    pub ordinal: u32,
    pub reason: String,
}

/// Surfaces replica shortfalls instead of hiding them in logs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProvisioningReport {
    pub requested: u32,
    pub provisioned: u32,
    pub failures: Vec<ReplicaFailure>,
}

impl ProvisioningReport {
    pub fn is_complete(&self) -> bool {
        self.provisioned == self.requested && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterProvisioned {
    pub cluster: ClusterInfo,
    pub report: ProvisioningReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaleClusterRequest {
    pub node_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaleOutcome {
    pub cluster_id: ClusterId,
    pub previous: u32,
    pub desired: u32,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Replicas selected for removal whose teardown failed.
    pub removal_failures: Vec<NodeId>,
    pub report: ProvisioningReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PromoteReplicaRequest {
    pub new_primary_node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailoverOutcome {
    pub cluster_id: ClusterId,
    pub promoted_node_id: NodeId,
    pub demoted_node_id: NodeId,
    pub former_primary_reattached: bool,
    /// Replicas that could not be re-pointed at the new primary.
    #[cfg_attr(feature = "serde", serde(default))]
    pub detached_replicas: Vec<NodeId>,
}

/// Per-node failures collected during a start or stop sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransitionReport {
    pub status: Option<InfrastructureStatus>,
    pub failed_nodes: Vec<NodeId>,
}

impl TransitionReport {
    pub fn merge(mut self, other: TransitionReport) -> Self {
        self.status = other.status.or(self.status);
        self.failed_nodes.extend(other.failed_nodes);
        self
    }
}

/// Where replication figures came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LagSource {
    /// Queried from the primary's replication view during this call.
    Live,
    /// Last values persisted on the node records.
    Stored,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicaStatus {
    pub node_id: NodeId,
    pub node_name: String,
    /// `streaming`, `catchup`, `disconnected`, ...
    pub state: String,
    /// `async`, `sync`, `quorum`, `potential`
    pub sync_state: String,
    pub lag_bytes: i64,
    pub lag_seconds: f64,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicationStatus {
    pub cluster_id: ClusterId,
    pub primary: Option<NodeId>,
    pub primary_name: Option<String>,
    pub source: LagSource,
    pub replicas: Vec<ReplicaStatus>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeStats {
    pub node_id: NodeId,
    pub node_name: String,
    pub role: NodeRole,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_bytes: u64,
    pub active_connections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterStats {
    pub cluster_id: ClusterId,
    pub total_connections: u32,
    pub total_memory_bytes: u64,
    pub average_cpu_percent: f64,
    pub nodes: Vec<NodeStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeLog {
    pub node_id: NodeId,
    pub node_name: String,
    pub role: NodeRole,
    pub collected_at: DateTime<Utc>,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterLogs {
    pub cluster_id: ClusterId,
    pub logs: Vec<NodeLog>,
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn create_request_defaults_optional_fields() {
        let body = r#"{
            "cluster_name": "orders",
            "postgres_version": "16",
            "node_count": 3,
            "postgres_password": "password123"
        }"#;
        let req: CreateClusterRequest =
            serde_json::from_str(body).expect("deserialize request");
        assert_eq!(req.replication_mode, ReplicationMode::Async);
        assert_eq!(req.cpu_per_node, 0);
        assert_eq!(req.node_count, 3);
    }

    #[test]
    fn lag_source_serializes_snake_case() {
        let json = serde_json::to_string(&LagSource::Stored).expect("serialize");
        assert_eq!(json, "\"stored\"");
    }
}
