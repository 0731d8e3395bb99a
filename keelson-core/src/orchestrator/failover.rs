use keelson_model::{
    Cluster, ClusterId, ClusterNode, FailoverOutcome, InfrastructureStatus, NodeId,
    ReplicationMode,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::ClusterOrchestrator;
use super::commands;
use super::readiness;
use crate::error::{ClusterError, Result};
use crate::events::ClusterEventKind;
use crate::runtime::ContainerRef;
use crate::store::StoreError;

/// Resolves `(current primary, target)` from the live node set.
pub(crate) fn resolve_failover<'a>(
    cluster_id: ClusterId,
    nodes: &'a [ClusterNode],
    target: NodeId,
) -> Result<(&'a ClusterNode, &'a ClusterNode)> {
    let target_node = nodes
        .iter()
        .find(|n| n.id == target)
        .ok_or(ClusterError::NodeNotFound {
            cluster: cluster_id,
            node: target,
        })?;
    if target_node.is_primary() {
        return Err(ClusterError::AlreadyPrimary(target));
    }
    let primary = nodes
        .iter()
        .find(|n| n.is_primary())
        .ok_or(ClusterError::NoPrimary(cluster_id))?;
    Ok((primary, target_node))
}

impl ClusterOrchestrator {
    #[instrument(
        name = "orchestrator.promote_replica",
        skip(self, cancel),
        fields(cluster_id = %id, target = %target),
        err
    )]
    pub async fn promote_replica(
        &self,
        id: ClusterId,
        target: NodeId,
        cancel: &CancellationToken,
    ) -> Result<FailoverOutcome> {
        let (_guard, cluster, infra) = self.lock_and_load(id).await?;
        if infra.status != InfrastructureStatus::Running {
            return Err(ClusterError::InvalidState {
                cluster: id,
                status: infra.status,
                operation: "promote a replica of",
            });
        }

        let nodes = self.clusters.list_nodes(id).await?;
        let (old_primary, new_primary) = resolve_failover(id, &nodes, target)?;
        let admin = cluster.credentials.admin_user.clone();
        let target_container = Self::container_of(new_primary);

        info!(cluster_id = %id, from = %old_primary.name, to = %new_primary.name, "promoting replica");
        let output = self
            .exec_step(
                &new_primary.name,
                &target_container,
                "promote",
                &commands::psql(&admin, &[commands::PROMOTE]),
            )
            .await?;
        if commands::parse_bool(&output.stdout) == Some(false) {
            return Err(ClusterError::CommandFailed {
                node: new_primary.name.clone(),
                step: "promote",
                detail: "pg_promote() returned false".to_string(),
            });
        }

        self.wait_recovery(&new_primary.name, &target_container, &admin, false, cancel)
            .await?;

        self.clusters.swap_primary(id, new_primary.id).await?;

        let mut attached = Vec::new();
        let mut detached_replicas = Vec::new();
        for sibling in nodes
            .iter()
            .filter(|n| n.id != old_primary.id && n.id != new_primary.id)
        {
            if self.repoint_replica(&cluster, sibling, new_primary).await {
                attached.push(sibling.name.clone());
            } else {
                detached_replicas.push(sibling.id);
            }
        }

        let reattached = self
            .reattach_former_primary(&cluster, old_primary, new_primary, cancel)
            .await;
        if reattached {
            attached.push(old_primary.name.clone());
        }

        if cluster.replication_mode == ReplicationMode::Sync {
            self.apply_sync_policy(&cluster, new_primary, &attached).await;
        }

        let detached: Vec<String> =
            detached_replicas.iter().map(NodeId::to_string).collect();
        self.events
            .emit(
                self.event(&cluster, ClusterEventKind::Failover)
                    .with("promoted_node", new_primary.id.to_string())
                    .with("demoted_node", old_primary.id.to_string())
                    .with("former_primary_reattached", reattached)
                    .with("detached_replicas", detached),
            )
            .await;
        info!(
            cluster_id = %id,
            promoted = %new_primary.name,
            reattached,
            detached = detached_replicas.len(),
            "failover complete"
        );

        Ok(FailoverOutcome {
            cluster_id: id,
            promoted_node_id: new_primary.id,
            demoted_node_id: old_primary.id,
            former_primary_reattached: reattached,
            detached_replicas,
        })
    }

    /// Polls `pg_is_in_recovery()` until it reports `in_recovery`, under the
    /// promotion policy.
    async fn wait_recovery(
        &self,
        node: &str,
        container: &ContainerRef,
        admin: &str,
        in_recovery: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let argv = commands::psql(admin, &[commands::IS_IN_RECOVERY]);
        let argv = &argv;
        readiness::wait_until(node, self.config.promotion, cancel, move || async move {
            let output = runtime.exec(container, argv).await?;
            Ok::<_, ClusterError>(
                output.success() && commands::parse_bool(&output.stdout) == Some(in_recovery),
            )
        })
        .await
    }

    /// Re-points a surviving replica at the new primary. The WAL receiver
    /// reconnects on reload.
    async fn repoint_replica(
        &self,
        cluster: &Cluster,
        replica: &ClusterNode,
        new_primary: &ClusterNode,
    ) -> bool {
        let creds = &cluster.credentials;
        let conninfo = commands::conninfo(
            &new_primary.name,
            &creds.replication_user,
            &creds.replication_password,
            &replica.name,
        );
        let statement = commands::primary_conninfo_statement(&conninfo);
        let result = self
            .exec_step(
                &replica.name,
                &Self::container_of(replica),
                "repoint_replica",
                &commands::psql(&creds.admin_user, &[&statement, commands::RELOAD_CONF]),
            )
            .await;
        match result {
            Ok(_) => true,
            Err(error) => {
                warn!(node = %replica.name, %error, "failed to re-point replica at new primary");
                self.mark_unhealthy(cluster.id, replica).await;
                false
            }
        }
    }

    /// Turns the demoted primary into a standby of the new primary and waits
    /// for it to come back in recovery. Without a rewind this only succeeds
    /// when the old timeline has not diverged.
    async fn reattach_former_primary(
        &self,
        cluster: &Cluster,
        old_primary: &ClusterNode,
        new_primary: &ClusterNode,
        cancel: &CancellationToken,
    ) -> bool {
        let container = Self::container_of(old_primary);
        let creds = &cluster.credentials;
        let conninfo = commands::conninfo(
            &new_primary.name,
            &creds.replication_user,
            &creds.replication_password,
            &old_primary.name,
        );
        let statement = commands::primary_conninfo_statement(&conninfo);

        let result = async {
            self.exec_step(
                &old_primary.name,
                &container,
                "set_primary_conninfo",
                &commands::psql(&creds.admin_user, &[&statement]),
            )
            .await?;
            self.exec_step(
                &old_primary.name,
                &container,
                "standby_signal",
                &commands::touch_standby_signal(),
            )
            .await?;
            self.runtime.restart_container(&container).await?;
            self.wait_ready(&old_primary.name, &container, cancel).await?;
            self.wait_recovery(&old_primary.name, &container, &creds.admin_user, true, cancel)
                .await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(error) => {
                warn!(node = %old_primary.name, %error, "failed to re-attach former primary");
                self.mark_unhealthy(cluster.id, old_primary).await;
                false
            }
        }
    }

    async fn mark_unhealthy(&self, cluster_id: ClusterId, node: &ClusterNode) {
        let result = async {
            let nodes = self.clusters.list_nodes(cluster_id).await?;
            if let Some(mut current) = nodes.into_iter().find(|n| n.id == node.id) {
                current.healthy = false;
                self.clusters.update_node(&current).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(error) = result {
            warn!(node = %node.name, %error, "failed to mark node unhealthy");
        }
    }
}
