//! Cluster, node, and infrastructure persistence ports.
//!
//! The orchestrator only talks to these traits. `InMemoryStore` backs tests and
//! ephemeral deployments; `PostgresStore` is the durable adapter.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use keelson_model::{
    Cluster, ClusterId, ClusterNode, InfrastructureId, InfrastructureRecord,
    InfrastructureStatus, NodeId,
};
use thiserror::Error;

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence of clusters and their nodes.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn create_cluster(&self, cluster: &Cluster) -> StoreResult<()>;

    async fn find_cluster(&self, id: ClusterId) -> StoreResult<Option<Cluster>>;

    async fn find_cluster_by_infrastructure(
        &self,
        infrastructure_id: InfrastructureId,
    ) -> StoreResult<Option<Cluster>>;

    /// Replaces the mutable columns of an existing cluster.
    async fn update_cluster(&self, cluster: &Cluster) -> StoreResult<()>;

    /// Deleting an unknown cluster is `NotFound`.
    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()>;

    /// Nodes of a cluster ordered by ordinal.
    async fn list_nodes(&self, cluster_id: ClusterId)
    -> StoreResult<Vec<ClusterNode>>;

    async fn create_node(&self, node: &ClusterNode) -> StoreResult<()>;

    async fn update_node(&self, node: &ClusterNode) -> StoreResult<()>;

    async fn delete_node(&self, id: NodeId) -> StoreResult<()>;

    /// Makes `new_primary` the only primary of the cluster in one step: the
    /// node becomes `Primary`, every other primary becomes `Replica`, and
    /// `Cluster.primary_node_id` is updated.
    async fn swap_primary(
        &self,
        cluster_id: ClusterId,
        new_primary: NodeId,
    ) -> StoreResult<()>;
}

/// Owner of the generic infrastructure record shared with other resource kinds.
#[async_trait]
pub trait InfrastructureStore: Send + Sync {
    async fn create(&self, record: &InfrastructureRecord) -> StoreResult<()>;

    async fn find(
        &self,
        id: InfrastructureId,
    ) -> StoreResult<Option<InfrastructureRecord>>;

    async fn set_status(
        &self,
        id: InfrastructureId,
        status: InfrastructureStatus,
    ) -> StoreResult<()>;
}
