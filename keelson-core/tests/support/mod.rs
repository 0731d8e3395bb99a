//! Shared harness for orchestrator integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use keelson_core::events::{ClusterEvent, ClusterEventKind, InProcEventBus};
use keelson_core::orchestrator::{ClusterOrchestrator, OrchestratorConfig};
use keelson_core::store::{ClusterStore, InMemoryStore, InfrastructureStore};
use keelson_core::testing::RecordingRuntime;
use keelson_model::{
    ClusterId, ClusterNode, ClusterProvisioned, CreateClusterRequest,
    InfrastructureStatus, ReplicationMode,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub runtime: Arc<RecordingRuntime>,
    pub store: Arc<InMemoryStore>,
    pub orchestrator: ClusterOrchestrator,
    pub cancel: CancellationToken,
    events: broadcast::Receiver<ClusterEvent>,
}

pub fn request(name: &str, version: &str, node_count: u32) -> CreateClusterRequest {
    CreateClusterRequest {
        cluster_name: name.to_string(),
        postgres_version: version.to_string(),
        node_count,
        cpu_per_node: 500,
        memory_per_node: 256 * 1024 * 1024,
        postgres_password: "password123".to_string(),
        replication_mode: ReplicationMode::Async,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::fast())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let runtime = Arc::new(RecordingRuntime::new());
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InProcEventBus::new(64));
        let events = bus.subscribe();
        let orchestrator = ClusterOrchestrator::new(
            runtime.clone(),
            store.clone(),
            store.clone(),
            bus,
            config,
        );
        Self {
            runtime,
            store,
            orchestrator,
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub async fn create(&self, node_count: u32) -> ClusterProvisioned {
        self.create_with(request("test", "16", node_count)).await
    }

    pub async fn create_with(&self, request: CreateClusterRequest) -> ClusterProvisioned {
        self.orchestrator
            .create_cluster("owner-1", request, &self.cancel)
            .await
            .expect("cluster should provision")
    }

    pub async fn nodes(&self, id: ClusterId) -> Vec<ClusterNode> {
        self.store.list_nodes(id).await.expect("list nodes")
    }

    pub async fn node_at(&self, id: ClusterId, ordinal: u32) -> ClusterNode {
        self.nodes(id)
            .await
            .into_iter()
            .find(|n| n.ordinal == ordinal)
            .expect("node with ordinal")
    }

    pub async fn status(&self, id: ClusterId) -> InfrastructureStatus {
        let cluster = self
            .store
            .find_cluster(id)
            .await
            .expect("find cluster")
            .expect("cluster exists");
        self.store
            .find(cluster.infrastructure_id)
            .await
            .expect("find infrastructure")
            .expect("infrastructure exists")
            .status
    }

    /// Events published since the last drain.
    pub fn drain_events(&mut self) -> Vec<ClusterEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn event_kinds(&mut self) -> Vec<ClusterEventKind> {
        self.drain_events().into_iter().map(|e| e.kind).collect()
    }
}
