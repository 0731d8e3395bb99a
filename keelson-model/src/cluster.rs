//! Cluster and node records for multi-node PostgreSQL deployments.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::ids::{ClusterId, InfrastructureId, NodeId};
use crate::infrastructure::UnknownVariant;

/// Port PostgreSQL listens on inside every node container.
pub const POSTGRES_PORT: u16 = 5432;

/// Role of a node inside its cluster. While a cluster is running exactly one
/// node holds [`NodeRole::Primary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NodeRole {
    Primary,
    Replica,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(NodeRole::Primary),
            "replica" => Ok(NodeRole::Replica),
            other => Err(UnknownVariant::new("node role", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ReplicationMode {
    #[default]
    Async,
    Sync,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Async => "async",
            ReplicationMode::Sync => "sync",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async" => Ok(ReplicationMode::Async),
            "sync" => Ok(ReplicationMode::Sync),
            other => Err(UnknownVariant::new("replication mode", other)),
        }
    }
}

/// Per-node container limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceLimits {
    /// Thousandths of a CPU core.
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

/// Credentials provisioned into every node of a cluster.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterCredentials {
    pub admin_user: String,
    pub admin_password: String,
    pub replication_user: String,
    pub replication_password: String,
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("replication_user", &self.replication_user)
            .field("replication_password", &"<redacted>")
            .finish()
    }
}

/// A logical multi-node PostgreSQL deployment.
///
/// `node_count` is the *desired* cardinality; the live node set may be
/// smaller after a replica failed to provision, but never larger.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cluster {
    pub id: ClusterId,
    pub infrastructure_id: InfrastructureId,
    pub name: String,
    pub node_count: u32,
    pub version: String,
    pub credentials: ClusterCredentials,
    pub network_id: Option<String>,
    pub resources: ResourceLimits,
    pub replication_mode: ReplicationMode,
    pub primary_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One container running PostgreSQL.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterNode {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    /// Assigned once at provisioning; replicas are retired highest first.
    pub ordinal: u32,
    /// Container name, doubling as the node's DNS alias on the cluster network.
    pub name: String,
    pub container_id: String,
    pub role: NodeRole,
    pub port: u16,
    pub volume: String,
    pub healthy: bool,
    pub replication_lag_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterNode {
    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        self.role == NodeRole::Replica
    }
}
