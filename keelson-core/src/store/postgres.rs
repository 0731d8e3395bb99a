use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keelson_model::{
    Cluster, ClusterCredentials, ClusterId, ClusterNode, InfrastructureId,
    InfrastructureKind, InfrastructureRecord, InfrastructureStatus, NodeId,
    NodeRole, ReplicationMode, ResourceLimits,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::{ClusterStore, InfrastructureStore, StoreError, StoreResult};
use crate::MIGRATOR;

const CLUSTER_COLUMNS: &str = r#"
    id, infrastructure_id, name, node_count, version,
    admin_user, admin_password, replication_user, replication_password,
    network_id, cpu_millis, memory_bytes, replication_mode, primary_node_id,
    created_at, updated_at
"#;

const NODE_COLUMNS: &str = r#"
    id, cluster_id, ordinal, name, container_id, role, port, volume,
    healthy, replication_lag_bytes, created_at, updated_at
"#;

/// sqlx-backed store for clusters, nodes, and infrastructure records.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        info!(max_connections, "connected to PostgreSQL store");
        Ok(Self { pool })
    }

    /// Applies the embedded migrations.
    pub async fn initialize_schema(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_cluster(row: &PgRow) -> StoreResult<Cluster> {
        let node_count: i32 = row.try_get("node_count")?;
        let mode: String = row.try_get("replication_mode")?;
        let primary: Option<Uuid> = row.try_get("primary_node_id")?;
        Ok(Cluster {
            id: ClusterId(row.try_get("id")?),
            infrastructure_id: InfrastructureId(row.try_get("infrastructure_id")?),
            name: row.try_get("name")?,
            node_count: u32::try_from(node_count)
                .map_err(|_| StoreError::Corrupt(format!("node_count {node_count}")))?,
            version: row.try_get("version")?,
            credentials: ClusterCredentials {
                admin_user: row.try_get("admin_user")?,
                admin_password: row.try_get("admin_password")?,
                replication_user: row.try_get("replication_user")?,
                replication_password: row.try_get("replication_password")?,
            },
            network_id: row.try_get("network_id")?,
            resources: ResourceLimits {
                cpu_millis: row.try_get("cpu_millis")?,
                memory_bytes: row.try_get("memory_bytes")?,
            },
            replication_mode: ReplicationMode::from_str(&mode)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            primary_node_id: primary.map(NodeId),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn map_node(row: &PgRow) -> StoreResult<ClusterNode> {
        let ordinal: i32 = row.try_get("ordinal")?;
        let port: i32 = row.try_get("port")?;
        let role: String = row.try_get("role")?;
        Ok(ClusterNode {
            id: NodeId(row.try_get("id")?),
            cluster_id: ClusterId(row.try_get("cluster_id")?),
            ordinal: u32::try_from(ordinal)
                .map_err(|_| StoreError::Corrupt(format!("ordinal {ordinal}")))?,
            name: row.try_get("name")?,
            container_id: row.try_get("container_id")?,
            role: NodeRole::from_str(&role)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            port: u16::try_from(port)
                .map_err(|_| StoreError::Corrupt(format!("port {port}")))?,
            volume: row.try_get("volume")?,
            healthy: row.try_get("healthy")?,
            replication_lag_bytes: row.try_get("replication_lag_bytes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_infrastructure(row: &PgRow) -> StoreResult<InfrastructureRecord> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(InfrastructureRecord {
            id: InfrastructureId(row.try_get("id")?),
            name: row.try_get("name")?,
            kind: InfrastructureKind::from_str(&kind)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: InfrastructureStatus::from_str(&status)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            owner_id: row.try_get("owner_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn expect_one(
    affected: u64,
    entity: &'static str,
    id: impl ToString,
) -> StoreResult<()> {
    if affected == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for PostgresStore {
    async fn create_cluster(&self, cluster: &Cluster) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO clusters ({CLUSTER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(cluster.id.to_uuid())
        .bind(cluster.infrastructure_id.to_uuid())
        .bind(&cluster.name)
        .bind(cluster.node_count as i32)
        .bind(&cluster.version)
        .bind(&cluster.credentials.admin_user)
        .bind(&cluster.credentials.admin_password)
        .bind(&cluster.credentials.replication_user)
        .bind(&cluster.credentials.replication_password)
        .bind(&cluster.network_id)
        .bind(cluster.resources.cpu_millis)
        .bind(cluster.resources.memory_bytes)
        .bind(cluster.replication_mode.as_str())
        .bind(cluster.primary_node_id.map(|id| id.to_uuid()))
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_cluster(&self, id: ClusterId) -> StoreResult<Option<Cluster>> {
        let row = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_cluster).transpose()
    }

    async fn find_cluster_by_infrastructure(
        &self,
        infrastructure_id: InfrastructureId,
    ) -> StoreResult<Option<Cluster>> {
        let row = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE infrastructure_id = $1"
        ))
        .bind(infrastructure_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_cluster).transpose()
    }

    async fn update_cluster(&self, cluster: &Cluster) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET name = $2,
                node_count = $3,
                version = $4,
                network_id = $5,
                cpu_millis = $6,
                memory_bytes = $7,
                replication_mode = $8,
                primary_node_id = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(cluster.id.to_uuid())
        .bind(&cluster.name)
        .bind(cluster.node_count as i32)
        .bind(&cluster.version)
        .bind(&cluster.network_id)
        .bind(cluster.resources.cpu_millis)
        .bind(cluster.resources.memory_bytes)
        .bind(cluster.replication_mode.as_str())
        .bind(cluster.primary_node_id.map(|id| id.to_uuid()))
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), "cluster", cluster.id)
    }

    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await?;
        expect_one(result.rows_affected(), "cluster", id)
    }

    async fn list_nodes(
        &self,
        cluster_id: ClusterId,
    ) -> StoreResult<Vec<ClusterNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM cluster_nodes WHERE cluster_id = $1 ORDER BY ordinal"
        ))
        .bind(cluster_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_node).collect()
    }

    async fn create_node(&self, node: &ClusterNode) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO cluster_nodes ({NODE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(node.id.to_uuid())
        .bind(node.cluster_id.to_uuid())
        .bind(node.ordinal as i32)
        .bind(&node.name)
        .bind(&node.container_id)
        .bind(node.role.as_str())
        .bind(i32::from(node.port))
        .bind(&node.volume)
        .bind(node.healthy)
        .bind(node.replication_lag_bytes)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!(
                    "node ordinal {} already exists in cluster {}",
                    node.ordinal, node.cluster_id
                ))
            }
            _ => StoreError::Database(e),
        })?;
        Ok(())
    }

    async fn update_node(&self, node: &ClusterNode) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_nodes
            SET container_id = $2,
                role = $3,
                port = $4,
                healthy = $5,
                replication_lag_bytes = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(node.id.to_uuid())
        .bind(&node.container_id)
        .bind(node.role.as_str())
        .bind(i32::from(node.port))
        .bind(node.healthy)
        .bind(node.replication_lag_bytes)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), "node", node.id)
    }

    async fn delete_node(&self, id: NodeId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM cluster_nodes WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await?;
        expect_one(result.rows_affected(), "node", id)
    }

    async fn swap_primary(
        &self,
        cluster_id: ClusterId,
        new_primary: NodeId,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let owned = sqlx::query(
            "SELECT 1 FROM cluster_nodes WHERE id = $1 AND cluster_id = $2 FOR UPDATE",
        )
        .bind(new_primary.to_uuid())
        .bind(cluster_id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            return Err(StoreError::not_found("node", new_primary));
        }

        // Demote first: the partial unique index allows one primary per cluster.
        sqlx::query(
            r#"
            UPDATE cluster_nodes
            SET role = 'replica', updated_at = NOW()
            WHERE cluster_id = $1 AND role = 'primary' AND id <> $2
            "#,
        )
        .bind(cluster_id.to_uuid())
        .bind(new_primary.to_uuid())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE cluster_nodes SET role = 'primary', updated_at = NOW() WHERE id = $1",
        )
        .bind(new_primary.to_uuid())
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE clusters SET primary_node_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(cluster_id.to_uuid())
        .bind(new_primary.to_uuid())
        .execute(&mut *tx)
        .await?;
        expect_one(result.rows_affected(), "cluster", cluster_id)?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl InfrastructureStore for PostgresStore {
    async fn create(&self, record: &InfrastructureRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO infrastructures (id, name, kind, status, owner_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.to_uuid())
        .bind(&record.name)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.owner_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        id: InfrastructureId,
    ) -> StoreResult<Option<InfrastructureRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, kind, status, owner_id, created_at, updated_at
            FROM infrastructures
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_infrastructure).transpose()
    }

    async fn set_status(
        &self,
        id: InfrastructureId,
        status: InfrastructureStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE infrastructures SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.to_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), "infrastructure", id)
    }
}
