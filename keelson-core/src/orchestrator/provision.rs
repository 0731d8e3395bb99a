use chrono::Utc;
use keelson_model::{
    Cluster, ClusterCredentials, ClusterId, ClusterNode, ClusterProvisioned,
    CreateClusterRequest, InfrastructureKind, InfrastructureRecord,
    InfrastructureStatus, NodeId, NodeRole, POSTGRES_PORT, ProvisioningReport,
    ReplicaFailure, ReplicationMode, ResourceLimits,
};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::ClusterOrchestrator;
use super::commands::{self, DATA_MOUNT, PGDATA};
use super::saga::{Compensation, Saga};
use crate::error::{ClusterError, Result};
use crate::events::ClusterEventKind;
use crate::runtime::{ContainerRef, ContainerSpec, NetworkRef, VolumeMount};

const REPLICATION_PASSWORD_LEN: usize = 24;
const MIN_PASSWORD_LEN: usize = 8;

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(REPLICATION_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

impl ClusterOrchestrator {
    pub(crate) fn validate_node_count(&self, node_count: u32) -> Result<()> {
        if node_count < 1 || node_count > self.config.max_nodes {
            return Err(ClusterError::Validation(format!(
                "node_count must be between 1 and {}, got {node_count}",
                self.config.max_nodes
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_create(&self, request: &CreateClusterRequest) -> Result<()> {
        if request.cluster_name.trim().is_empty() {
            return Err(ClusterError::Validation("cluster_name is required".into()));
        }
        if request.postgres_version.trim().is_empty() {
            return Err(ClusterError::Validation(
                "postgres_version is required".into(),
            ));
        }
        self.validate_node_count(request.node_count)?;
        if request.postgres_password.len() < MIN_PASSWORD_LEN {
            return Err(ClusterError::Validation(format!(
                "postgres_password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if request.cpu_per_node < 0 || request.memory_per_node < 0 {
            return Err(ClusterError::Validation(
                "resource limits must not be negative".into(),
            ));
        }
        Ok(())
    }

    #[instrument(
        name = "orchestrator.create_cluster",
        skip(self, request, cancel),
        fields(cluster_name = %request.cluster_name, node_count = request.node_count),
        err
    )]
    pub async fn create_cluster(
        &self,
        owner_id: &str,
        request: CreateClusterRequest,
        cancel: &CancellationToken,
    ) -> Result<ClusterProvisioned> {
        self.validate_create(&request)?;

        let infra = InfrastructureRecord::new(
            request.cluster_name.clone(),
            InfrastructureKind::PostgresCluster,
            owner_id,
        );
        self.infrastructures.create(&infra).await?;

        let now = Utc::now();
        let mut cluster = Cluster {
            id: ClusterId::new(),
            infrastructure_id: infra.id,
            name: request.cluster_name.clone(),
            node_count: request.node_count,
            version: request.postgres_version.clone(),
            credentials: ClusterCredentials {
                admin_user: self.config.admin_user.clone(),
                admin_password: request.postgres_password.clone(),
                replication_user: self.config.replication_user.clone(),
                replication_password: generate_password(),
            },
            network_id: None,
            resources: ResourceLimits {
                cpu_millis: request.cpu_per_node,
                memory_bytes: request.memory_per_node,
            },
            replication_mode: request.replication_mode,
            primary_node_id: None,
            created_at: now,
            updated_at: now,
        };
        self.clusters.create_cluster(&cluster).await?;
        let _guard = self.locks.try_acquire(cluster.id)?;

        info!(cluster_id = %cluster.id, "provisioning cluster");

        let network_name = self.network_name(cluster.id);
        let network = match self.runtime.create_network(&network_name).await {
            Ok(network) => network,
            Err(error) => {
                let error = ClusterError::from(error);
                warn!(cluster_id = %cluster.id, step = "create_network", %error, "cluster provisioning failed");
                self.mark_failed(&cluster, &error).await;
                return Err(error);
            }
        };

        let mut saga = Saga::new();
        saga.push(Compensation::RemoveNetwork(network.clone()));

        let mut report = ProvisioningReport {
            requested: request.node_count,
            provisioned: 0,
            failures: Vec::new(),
        };

        let result = self
            .provision_nodes(&mut cluster, &network, &mut saga, &mut report, cancel)
            .await;
        if let Err(error) = result {
            warn!(cluster_id = %cluster.id, %error, "cluster provisioning failed, rolling back");
            let undo_failures = saga
                .compensate(self.runtime.as_ref(), self.clusters.as_ref())
                .await;
            if undo_failures > 0 {
                warn!(cluster_id = %cluster.id, undo_failures, "rollback left resources behind");
            }
            cluster.network_id = None;
            cluster.primary_node_id = None;
            if let Err(store_error) = self.clusters.update_cluster(&cluster).await {
                warn!(cluster_id = %cluster.id, error = %store_error, "failed to clear cluster references");
            }
            self.mark_failed(&cluster, &error).await;
            return Err(error);
        }
        saga.commit();

        self.set_status(&cluster, InfrastructureStatus::Running).await?;
        self.events
            .emit(
                self.event(&cluster, ClusterEventKind::Created)
                    .with("status", InfrastructureStatus::Running.as_str())
                    .with("requested", report.requested)
                    .with("provisioned", report.provisioned),
            )
            .await;
        info!(
            cluster_id = %cluster.id,
            requested = report.requested,
            provisioned = report.provisioned,
            "cluster created"
        );

        let info = self.get_cluster_info(cluster.id).await?;
        Ok(ClusterProvisioned {
            cluster: info,
            report,
        })
    }

    /// Primary (fatal) then replicas (best-effort). Successful replica steps are
    /// appended to `saga` so a later fatal error still removes them.
    async fn provision_nodes(
        &self,
        cluster: &mut Cluster,
        network: &NetworkRef,
        saga: &mut Saga,
        report: &mut ProvisioningReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cluster.network_id = Some(network.as_str().to_string());
        self.clusters.update_cluster(cluster).await?;

        let primary = self.provision_primary(cluster, saga, cancel).await?;
        report.provisioned = 1;

        let mut attached = Vec::new();
        for ordinal in 1..cluster.node_count {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled(format!(
                    "provisioning cluster {}",
                    cluster.id
                )));
            }
            match self.provision_replica(cluster, &primary, ordinal, cancel).await {
                Ok((node, steps)) => {
                    saga.absorb(steps);
                    report.provisioned += 1;
                    attached.push(node.name);
                }
                Err(error @ ClusterError::Cancelled(_)) => return Err(error),
                Err(error) => {
                    warn!(cluster_id = %cluster.id, ordinal, %error, "replica provisioning failed");
                    report.failures.push(ReplicaFailure {
                        ordinal,
                        reason: error.to_string(),
                    });
                }
            }
        }

        if cluster.replication_mode == ReplicationMode::Sync && !attached.is_empty() {
            self.apply_sync_policy(cluster, &primary, &attached).await;
        }
        Ok(())
    }

    fn base_env(&self, cluster: &Cluster) -> Vec<(String, String)> {
        vec![
            (
                "POSTGRES_USER".to_string(),
                cluster.credentials.admin_user.clone(),
            ),
            (
                "POSTGRES_PASSWORD".to_string(),
                cluster.credentials.admin_password.clone(),
            ),
            ("POSTGRES_DB".to_string(), "postgres".to_string()),
            ("PGDATA".to_string(), PGDATA.to_string()),
        ]
    }

    fn node_container_spec(
        &self,
        cluster: &Cluster,
        ordinal: u32,
        command: Option<Vec<String>>,
    ) -> ContainerSpec {
        let name = self.node_name(cluster.id, ordinal);
        ContainerSpec {
            name: name.clone(),
            image: self.image(&cluster.version),
            env: self.base_env(cluster),
            command,
            published_ports: vec![POSTGRES_PORT],
            volumes: vec![VolumeMount {
                volume: self.volume_name(cluster.id, ordinal),
                target: DATA_MOUNT.to_string(),
            }],
            network: Some(self.network_name(cluster.id)),
            network_alias: Some(name),
            limits: cluster.resources,
            labels: vec![
                ("keelson.cluster".to_string(), cluster.id.to_string()),
                ("keelson.ordinal".to_string(), ordinal.to_string()),
            ],
        }
    }

    /// Host port published for 5432, or 5432 when it cannot be determined.
    async fn published_port(&self, node: &str, container: &ContainerRef) -> u16 {
        match self.runtime.inspect_container(container).await {
            Ok(state) => state.host_port(POSTGRES_PORT).unwrap_or(POSTGRES_PORT),
            Err(error) => {
                warn!(node, %error, "inspect failed, assuming default port");
                POSTGRES_PORT
            }
        }
    }

    fn new_node(
        cluster: &Cluster,
        ordinal: u32,
        name: String,
        container: &ContainerRef,
        role: NodeRole,
        port: u16,
        volume: String,
    ) -> ClusterNode {
        let now = Utc::now();
        ClusterNode {
            id: NodeId::new(),
            cluster_id: cluster.id,
            ordinal,
            name,
            container_id: container.as_str().to_string(),
            role,
            port,
            volume,
            healthy: true,
            replication_lag_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn provision_primary(
        &self,
        cluster: &mut Cluster,
        saga: &mut Saga,
        cancel: &CancellationToken,
    ) -> Result<ClusterNode> {
        let spec = self.node_container_spec(cluster, 0, None);
        let name = spec.name.clone();
        let volume = self.volume_name(cluster.id, 0);

        self.runtime.create_volume(&volume).await?;
        saga.push(Compensation::RemoveVolume(volume.clone()));

        let container = self.runtime.create_container(&spec).await?;
        saga.push(Compensation::RemoveContainer(container.clone()));

        self.runtime.start_container(&container).await?;
        self.wait_ready(&name, &container, cancel).await?;

        let user = cluster.credentials.admin_user.clone();
        let role_sql = commands::create_replication_role(
            &cluster.credentials.replication_user,
            &cluster.credentials.replication_password,
        );
        self.exec_step(
            &name,
            &container,
            "create_replication_role",
            &commands::psql(&user, &[&role_sql]),
        )
        .await?;
        self.exec_step(
            &name,
            &container,
            "allow_replication",
            &commands::allow_replication_hba(&cluster.credentials.replication_user),
        )
        .await?;
        self.exec_step(
            &name,
            &container,
            "reload_config",
            &commands::psql(&user, &[commands::RELOAD_CONF]),
        )
        .await?;

        let port = self.published_port(&name, &container).await;
        let node = Self::new_node(
            cluster,
            0,
            name,
            &container,
            NodeRole::Primary,
            port,
            volume,
        );
        self.clusters.create_node(&node).await?;
        saga.push(Compensation::DeleteNode(node.id));

        cluster.primary_node_id = Some(node.id);
        self.clusters.update_cluster(cluster).await?;
        info!(cluster_id = %cluster.id, node = %node.name, port, "primary ready");
        Ok(node)
    }

    /// Bootstraps one streaming replica of `primary`. On failure this replica's
    /// own effects are undone before the error is returned; on success the
    /// undo steps are handed back to the caller.
    pub(crate) async fn provision_replica(
        &self,
        cluster: &Cluster,
        primary: &ClusterNode,
        ordinal: u32,
        cancel: &CancellationToken,
    ) -> Result<(ClusterNode, Saga)> {
        let mut saga = Saga::new();
        match self
            .bootstrap_replica(cluster, primary, ordinal, &mut saga, cancel)
            .await
        {
            Ok(node) => Ok((node, saga)),
            Err(error) => {
                saga.compensate(self.runtime.as_ref(), self.clusters.as_ref())
                    .await;
                Err(error)
            }
        }
    }

    async fn bootstrap_replica(
        &self,
        cluster: &Cluster,
        primary: &ClusterNode,
        ordinal: u32,
        saga: &mut Saga,
        cancel: &CancellationToken,
    ) -> Result<ClusterNode> {
        let spec = self.node_container_spec(
            cluster,
            ordinal,
            Some(commands::replica_container_command()),
        );
        let name = spec.name.clone();
        let volume = self.volume_name(cluster.id, ordinal);
        let creds = &cluster.credentials;

        self.runtime.create_volume(&volume).await?;
        saga.push(Compensation::RemoveVolume(volume.clone()));

        let container = self.runtime.create_container(&spec).await?;
        saga.push(Compensation::RemoveContainer(container.clone()));

        self.runtime.start_container(&container).await?;

        self.exec_step(
            &name,
            &container,
            "base_backup",
            &commands::base_backup(
                &primary.name,
                &creds.replication_user,
                &creds.replication_password,
            ),
        )
        .await?;

        let conninfo = commands::conninfo(
            &primary.name,
            &creds.replication_user,
            &creds.replication_password,
            &name,
        );
        self.exec_step(
            &name,
            &container,
            "configure_standby",
            &commands::finish_replica_bootstrap(&conninfo),
        )
        .await?;

        self.runtime.restart_container(&container).await?;
        self.wait_ready(&name, &container, cancel).await?;

        let port = self.published_port(&name, &container).await;
        let node = Self::new_node(
            cluster,
            ordinal,
            name,
            &container,
            NodeRole::Replica,
            port,
            volume,
        );
        self.clusters.create_node(&node).await?;
        saga.push(Compensation::DeleteNode(node.id));
        info!(cluster_id = %cluster.id, node = %node.name, port, "replica attached");
        Ok(node)
    }

    /// Sets `synchronous_standby_names` on the primary. Best-effort: failures
    /// are logged only.
    pub(crate) async fn apply_sync_policy(
        &self,
        cluster: &Cluster,
        primary: &ClusterNode,
        standbys: &[String],
    ) {
        let statement = commands::sync_standby_statement(standbys);
        let argv = commands::psql(
            &cluster.credentials.admin_user,
            &[&statement, commands::RELOAD_CONF],
        );
        let container = Self::container_of(primary);
        if let Err(error) = self
            .exec_step(&primary.name, &container, "sync_policy", &argv)
            .await
        {
            warn!(cluster_id = %cluster.id, node = %primary.name, %error, "failed to apply synchronous standby policy");
        }
    }
}
