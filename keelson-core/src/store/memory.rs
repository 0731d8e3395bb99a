use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use keelson_model::{
    Cluster, ClusterId, ClusterNode, InfrastructureId, InfrastructureRecord,
    InfrastructureStatus, NodeId, NodeRole,
};
use tokio::sync::RwLock;

use super::{ClusterStore, InfrastructureStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    clusters: HashMap<ClusterId, Cluster>,
    nodes: HashMap<NodeId, ClusterNode>,
    infrastructures: HashMap<InfrastructureId, InfrastructureRecord>,
}

/// Process-local store. All tables share one lock so multi-row updates such as
/// [`ClusterStore::swap_primary`] are atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cluster_count(&self) -> usize {
        self.state.read().await.clusters.len()
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn create_cluster(&self, cluster: &Cluster) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.clusters.contains_key(&cluster.id) {
            return Err(StoreError::Conflict(format!(
                "cluster {} already exists",
                cluster.id
            )));
        }
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn find_cluster(&self, id: ClusterId) -> StoreResult<Option<Cluster>> {
        Ok(self.state.read().await.clusters.get(&id).cloned())
    }

    async fn find_cluster_by_infrastructure(
        &self,
        infrastructure_id: InfrastructureId,
    ) -> StoreResult<Option<Cluster>> {
        Ok(self
            .state
            .read()
            .await
            .clusters
            .values()
            .find(|c| c.infrastructure_id == infrastructure_id)
            .cloned())
    }

    async fn update_cluster(&self, cluster: &Cluster) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let slot = state
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| StoreError::not_found("cluster", cluster.id))?;
        *slot = Cluster {
            updated_at: Utc::now(),
            ..cluster.clone()
        };
        Ok(())
    }

    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .clusters
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("cluster", id))?;
        state.nodes.retain(|_, node| node.cluster_id != id);
        Ok(())
    }

    async fn list_nodes(
        &self,
        cluster_id: ClusterId,
    ) -> StoreResult<Vec<ClusterNode>> {
        let state = self.state.read().await;
        let mut nodes: Vec<ClusterNode> = state
            .nodes
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.ordinal);
        Ok(nodes)
    }

    async fn create_node(&self, node: &ClusterNode) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.clusters.contains_key(&node.cluster_id) {
            return Err(StoreError::not_found("cluster", node.cluster_id));
        }
        let duplicate = state.nodes.values().any(|n| {
            n.id == node.id
                || (n.cluster_id == node.cluster_id && n.ordinal == node.ordinal)
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "node {} (ordinal {}) already exists",
                node.id, node.ordinal
            )));
        }
        state.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &ClusterNode) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let slot = state
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| StoreError::not_found("node", node.id))?;
        *slot = ClusterNode {
            updated_at: Utc::now(),
            ..node.clone()
        };
        Ok(())
    }

    async fn delete_node(&self, id: NodeId) -> StoreResult<()> {
        self.state
            .write()
            .await
            .nodes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn swap_primary(
        &self,
        cluster_id: ClusterId,
        new_primary: NodeId,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.nodes.get(&new_primary) {
            Some(node) if node.cluster_id == cluster_id => {}
            _ => return Err(StoreError::not_found("node", new_primary)),
        }
        if !state.clusters.contains_key(&cluster_id) {
            return Err(StoreError::not_found("cluster", cluster_id));
        }

        let now = Utc::now();
        for node in state
            .nodes
            .values_mut()
            .filter(|n| n.cluster_id == cluster_id)
        {
            let role = if node.id == new_primary {
                NodeRole::Primary
            } else {
                NodeRole::Replica
            };
            if node.role != role {
                node.role = role;
                node.updated_at = now;
            }
        }
        if let Some(cluster) = state.clusters.get_mut(&cluster_id) {
            cluster.primary_node_id = Some(new_primary);
            cluster.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl InfrastructureStore for InMemoryStore {
    async fn create(&self, record: &InfrastructureRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.infrastructures.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "infrastructure {} already exists",
                record.id
            )));
        }
        state.infrastructures.insert(record.id, record.clone());
        Ok(())
    }

    async fn find(
        &self,
        id: InfrastructureId,
    ) -> StoreResult<Option<InfrastructureRecord>> {
        Ok(self.state.read().await.infrastructures.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: InfrastructureId,
        status: InfrastructureStatus,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .infrastructures
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("infrastructure", id))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keelson_model::{
        ClusterCredentials, InfrastructureKind, ReplicationMode, ResourceLimits,
    };

    use super::*;

    fn cluster(infra: &InfrastructureRecord) -> Cluster {
        let now = Utc::now();
        Cluster {
            id: ClusterId::new(),
            infrastructure_id: infra.id,
            name: "orders".into(),
            node_count: 2,
            version: "16".into(),
            credentials: ClusterCredentials {
                admin_user: "postgres".into(),
                admin_password: "password1".into(),
                replication_user: "replicator".into(),
                replication_password: "s3cret".into(),
            },
            network_id: None,
            resources: ResourceLimits::default(),
            replication_mode: ReplicationMode::Async,
            primary_node_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn node(cluster_id: ClusterId, ordinal: u32, role: NodeRole) -> ClusterNode {
        let now = Utc::now();
        ClusterNode {
            id: NodeId::new(),
            cluster_id,
            ordinal,
            name: format!("pg-{ordinal}"),
            container_id: format!("c{ordinal}"),
            role,
            port: 5432,
            volume: format!("vol-{ordinal}"),
            healthy: true,
            replication_lag_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn swap_primary_leaves_exactly_one_primary() {
        let store = InMemoryStore::new();
        let infra =
            InfrastructureRecord::new("orders", InfrastructureKind::PostgresCluster, "u1");
        store.create(&infra).await.unwrap();
        let cluster = cluster(&infra);
        store.create_cluster(&cluster).await.unwrap();

        let primary = node(cluster.id, 0, NodeRole::Primary);
        let replica = node(cluster.id, 1, NodeRole::Replica);
        store.create_node(&primary).await.unwrap();
        store.create_node(&replica).await.unwrap();

        store.swap_primary(cluster.id, replica.id).await.unwrap();

        let nodes = store.list_nodes(cluster.id).await.unwrap();
        let primaries: Vec<_> = nodes.iter().filter(|n| n.is_primary()).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, replica.id);
        let stored = store.find_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.primary_node_id, Some(replica.id));
    }

    #[tokio::test]
    async fn swap_primary_rejects_foreign_node() {
        let store = InMemoryStore::new();
        let infra =
            InfrastructureRecord::new("a", InfrastructureKind::PostgresCluster, "u1");
        store.create(&infra).await.unwrap();
        let a = cluster(&infra);
        let b = cluster(&infra);
        store.create_cluster(&a).await.unwrap();
        store.create_cluster(&b).await.unwrap();
        let foreign = node(b.id, 0, NodeRole::Primary);
        store.create_node(&foreign).await.unwrap();

        let err = store.swap_primary(a.id, foreign.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "node", .. }));
    }

    #[tokio::test]
    async fn nodes_are_listed_by_ordinal_and_ordinals_are_unique() {
        let store = InMemoryStore::new();
        let infra =
            InfrastructureRecord::new("a", InfrastructureKind::PostgresCluster, "u1");
        store.create(&infra).await.unwrap();
        let cluster = cluster(&infra);
        store.create_cluster(&cluster).await.unwrap();

        store
            .create_node(&node(cluster.id, 2, NodeRole::Replica))
            .await
            .unwrap();
        store
            .create_node(&node(cluster.id, 0, NodeRole::Primary))
            .await
            .unwrap();
        let dup = store
            .create_node(&node(cluster.id, 2, NodeRole::Replica))
            .await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        let ordinals: Vec<u32> = store
            .list_nodes(cluster.id)
            .await
            .unwrap()
            .iter()
            .map(|n| n.ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 2]);
    }

    #[tokio::test]
    async fn delete_cluster_cascades_nodes_and_second_delete_is_not_found() {
        let store = InMemoryStore::new();
        let infra =
            InfrastructureRecord::new("a", InfrastructureKind::PostgresCluster, "u1");
        store.create(&infra).await.unwrap();
        let cluster = cluster(&infra);
        store.create_cluster(&cluster).await.unwrap();
        store
            .create_node(&node(cluster.id, 0, NodeRole::Primary))
            .await
            .unwrap();

        store.delete_cluster(cluster.id).await.unwrap();
        assert!(store.list_nodes(cluster.id).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_cluster(cluster.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_status_updates_record() {
        let store = InMemoryStore::new();
        let infra =
            InfrastructureRecord::new("a", InfrastructureKind::PostgresCluster, "u1");
        store.create(&infra).await.unwrap();
        store
            .set_status(infra.id, InfrastructureStatus::Running)
            .await
            .unwrap();
        let found = store.find(infra.id).await.unwrap().unwrap();
        assert_eq!(found.status, InfrastructureStatus::Running);
        assert!(store.find_cluster_by_infrastructure(infra.id).await.unwrap().is_none());
    }
}
