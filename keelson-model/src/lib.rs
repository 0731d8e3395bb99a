//! Core data model definitions shared across Keelson crates.
#![allow(missing_docs)]

pub mod api;
pub mod cluster;
pub mod ids;
pub mod infrastructure;

pub use api::{
    ClusterInfo, ClusterLogs, ClusterProvisioned, ClusterStats,
    CreateClusterRequest, FailoverOutcome, LagSource, NodeInfo, NodeLog,
    NodeStats, PromoteReplicaRequest, ProvisioningReport, ReplicaFailure,
    ReplicaStatus, ReplicationStatus, ScaleClusterRequest, ScaleOutcome,
    TransitionReport,
};
pub use cluster::{
    Cluster, ClusterCredentials, ClusterNode, NodeRole, POSTGRES_PORT,
    ReplicationMode, ResourceLimits,
};
pub use ids::{ClusterId, InfrastructureId, NodeId};
pub use infrastructure::{
    InfrastructureKind, InfrastructureRecord, InfrastructureStatus,
    UnknownVariant,
};
