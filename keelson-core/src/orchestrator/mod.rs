//! The Cluster Orchestrator.
//!
//! Owns every sequencing decision for a replicated PostgreSQL cluster: what
//! runs in which order, which failures are fatal, and what gets rolled back.
//! Effects go through [`ContainerRuntime`]; state through the store traits.

pub mod commands;
pub mod config;
mod failover;
mod lifecycle;
pub mod locks;
mod provision;
pub mod readiness;
pub mod saga;
mod scale;
mod status;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use keelson_model::{
    Cluster, ClusterId, ClusterInfo, ClusterLogs, ClusterNode,
    ClusterProvisioned, ClusterStats, CreateClusterRequest, FailoverOutcome,
    InfrastructureRecord, InfrastructureStatus, NodeId, ReplicationStatus,
    ScaleOutcome, TransitionReport,
};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use config::{OrchestratorConfig, ReadinessPolicy};
pub use locks::ClusterLocks;

use crate::error::{ClusterError, Result};
use crate::events::{
    ClusterEvent, ClusterEventKind, EventNotifier, EventPublisher,
};
use crate::runtime::{ContainerRef, ContainerRuntime, ExecOutput};
use crate::store::{ClusterStore, InfrastructureStore, StoreError};

/// Public surface of the cluster control plane.
#[async_trait]
pub trait ClusterService: Send + Sync {
    async fn create_cluster(
        &self,
        owner_id: &str,
        request: CreateClusterRequest,
        cancel: &CancellationToken,
    ) -> Result<ClusterProvisioned>;

    async fn get_cluster_info(&self, id: ClusterId) -> Result<ClusterInfo>;

    async fn start_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport>;

    async fn stop_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport>;

    async fn restart_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport>;

    async fn delete_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport>;

    async fn scale_cluster(
        &self,
        id: ClusterId,
        node_count: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleOutcome>;

    async fn promote_replica(
        &self,
        id: ClusterId,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<FailoverOutcome>;

    async fn get_replication_status(
        &self,
        id: ClusterId,
    ) -> Result<ReplicationStatus>;

    async fn get_cluster_stats(&self, id: ClusterId) -> Result<ClusterStats>;

    /// `tail` defaults to the configured log tail.
    async fn get_cluster_logs(
        &self,
        id: ClusterId,
        tail: Option<usize>,
    ) -> Result<ClusterLogs>;
}

pub struct ClusterOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    clusters: Arc<dyn ClusterStore>,
    infrastructures: Arc<dyn InfrastructureStore>,
    events: EventNotifier,
    locks: ClusterLocks,
    config: OrchestratorConfig,
}

impl fmt::Debug for ClusterOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOrchestrator")
            .field("config", &self.config)
            .field("locks", &self.tracked_locks())
            .finish_non_exhaustive()
    }
}

impl ClusterOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        clusters: Arc<dyn ClusterStore>,
        infrastructures: Arc<dyn InfrastructureStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OrchestratorConfig,
    ) -> Self {
        let events = EventNotifier::new(publisher, config.event_timeout);
        Self {
            runtime,
            clusters,
            infrastructures,
            events,
            locks: ClusterLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn network_name(&self, cluster_id: ClusterId) -> String {
        format!("{}-net-{}", self.config.name_prefix, cluster_id)
    }

    fn node_name(&self, cluster_id: ClusterId, ordinal: u32) -> String {
        format!("{}-pg-{}-{}", self.config.name_prefix, cluster_id, ordinal)
    }

    fn volume_name(&self, cluster_id: ClusterId, ordinal: u32) -> String {
        format!("{}-pgdata-{}-{}", self.config.name_prefix, cluster_id, ordinal)
    }

    fn image(&self, version: &str) -> String {
        format!("{}:{}", self.config.image, version)
    }

    async fn load(
        &self,
        id: ClusterId,
    ) -> Result<(Cluster, InfrastructureRecord)> {
        let cluster = self
            .clusters
            .find_cluster(id)
            .await?
            .ok_or(ClusterError::ClusterNotFound(id))?;
        let infra = self
            .infrastructures
            .find(cluster.infrastructure_id)
            .await?
            .ok_or_else(|| {
                StoreError::not_found("infrastructure", cluster.infrastructure_id)
            })?;
        Ok((cluster, infra))
    }

    /// Takes the cluster lock, then loads the cluster. The lock entry is
    /// dropped again when the cluster does not exist.
    async fn lock_and_load(
        &self,
        id: ClusterId,
    ) -> Result<(OwnedMutexGuard<()>, Cluster, InfrastructureRecord)> {
        let guard = self.locks.try_acquire(id)?;
        match self.load(id).await {
            Ok((cluster, infra)) => Ok((guard, cluster, infra)),
            Err(error) => {
                if matches!(error, ClusterError::ClusterNotFound(_)) {
                    drop(guard);
                    self.locks.forget(id);
                }
                Err(error)
            }
        }
    }

    /// Number of clusters with a lock entry.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    async fn set_status(
        &self,
        cluster: &Cluster,
        status: InfrastructureStatus,
    ) -> Result<()> {
        self.infrastructures
            .set_status(cluster.infrastructure_id, status)
            .await?;
        Ok(())
    }

    /// Status write on a path that is already failing; the original error
    /// wins, so this one is only logged.
    async fn mark_failed(&self, cluster: &Cluster, error: &ClusterError) {
        if let Err(status_error) =
            self.set_status(cluster, InfrastructureStatus::Failed).await
        {
            warn!(cluster_id = %cluster.id, error = %status_error, "failed to record failed status");
        }
        self.events
            .emit(
                self.event(cluster, ClusterEventKind::Failed)
                    .with("status", InfrastructureStatus::Failed.as_str())
                    .with("error", error.to_string()),
            )
            .await;
    }

    fn event(&self, cluster: &Cluster, kind: ClusterEventKind) -> ClusterEvent {
        ClusterEvent::new(cluster.id, cluster.infrastructure_id, kind)
    }

    /// Runs a command inside a node; a non-zero exit is a
    /// [`ClusterError::CommandFailed`] for `step`.
    async fn exec_step(
        &self,
        node: &str,
        container: &ContainerRef,
        step: &'static str,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let output = self.runtime.exec(container, argv).await?;
        if output.success() {
            return Ok(output);
        }
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Err(ClusterError::CommandFailed {
            node: node.to_string(),
            step,
            detail: format!("exit code {}: {detail}", output.exit_code),
        })
    }

    /// Polls `pg_isready` inside the node under the readiness policy.
    async fn wait_ready(
        &self,
        node: &str,
        container: &ContainerRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let argv = commands::pg_isready(&self.config.admin_user);
        let argv = &argv;
        readiness::wait_until(node, self.config.readiness, cancel, move || async move {
            let output = runtime.exec(container, argv).await?;
            Ok::<_, ClusterError>(output.success())
        })
        .await
    }

    fn container_of(node: &ClusterNode) -> ContainerRef {
        ContainerRef(node.container_id.clone())
    }
}

#[async_trait]
impl ClusterService for ClusterOrchestrator {
    async fn create_cluster(
        &self,
        owner_id: &str,
        request: CreateClusterRequest,
        cancel: &CancellationToken,
    ) -> Result<ClusterProvisioned> {
        ClusterOrchestrator::create_cluster(self, owner_id, request, cancel).await
    }

    async fn get_cluster_info(&self, id: ClusterId) -> Result<ClusterInfo> {
        ClusterOrchestrator::get_cluster_info(self, id).await
    }

    async fn start_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        ClusterOrchestrator::start_cluster(self, id, cancel).await
    }

    async fn stop_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        ClusterOrchestrator::stop_cluster(self, id, cancel).await
    }

    async fn restart_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        ClusterOrchestrator::restart_cluster(self, id, cancel).await
    }

    async fn delete_cluster(
        &self,
        id: ClusterId,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport> {
        ClusterOrchestrator::delete_cluster(self, id, cancel).await
    }

    async fn scale_cluster(
        &self,
        id: ClusterId,
        node_count: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleOutcome> {
        ClusterOrchestrator::scale_cluster(self, id, node_count, cancel).await
    }

    async fn promote_replica(
        &self,
        id: ClusterId,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<FailoverOutcome> {
        ClusterOrchestrator::promote_replica(self, id, node_id, cancel).await
    }

    async fn get_replication_status(
        &self,
        id: ClusterId,
    ) -> Result<ReplicationStatus> {
        ClusterOrchestrator::get_replication_status(self, id).await
    }

    async fn get_cluster_stats(&self, id: ClusterId) -> Result<ClusterStats> {
        ClusterOrchestrator::get_cluster_stats(self, id).await
    }

    async fn get_cluster_logs(
        &self,
        id: ClusterId,
        tail: Option<usize>,
    ) -> Result<ClusterLogs> {
        ClusterOrchestrator::get_cluster_logs(self, id, tail).await
    }
}
