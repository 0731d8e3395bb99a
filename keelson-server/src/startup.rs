use std::sync::Arc;

use anyhow::Context;
use keelson_config::{Config, DatabaseConfig};
use keelson_core::{
    ClusterOrchestrator, ClusterService, ClusterStore, DockerCli, EventPublisher,
    InMemoryStore, InProcEventBus, InfrastructureStore, PostgresStore,
    RedisEventPublisher,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Connects the persistence, runtime, and event adapters named by `config`
/// and wires them into an orchestrator.
pub async fn build_service(config: &Config) -> anyhow::Result<Arc<dyn ClusterService>> {
    let runtime = Arc::new(DockerCli::new(config.runtime.docker_binary.clone()));
    info!(binary = %config.runtime.docker_binary, "using docker CLI runtime");

    let (clusters, infrastructures): (Arc<dyn ClusterStore>, Arc<dyn InfrastructureStore>) =
        match &config.database {
            Some(database) => {
                let store = Arc::new(connect_store(database).await?);
                let clusters: Arc<dyn ClusterStore> = store.clone();
                let infrastructures: Arc<dyn InfrastructureStore> = store;
                (clusters, infrastructures)
            }
            None => {
                warn!("no database configured; cluster records will not survive a restart");
                let store = Arc::new(InMemoryStore::new());
                let clusters: Arc<dyn ClusterStore> = store.clone();
                let infrastructures: Arc<dyn InfrastructureStore> = store;
                (clusters, infrastructures)
            }
        };

    let publisher: Arc<dyn EventPublisher> = match &config.redis {
        Some(redis) => Arc::new(
            RedisEventPublisher::connect(&redis.url, redis.channel.clone())
                .await
                .context("failed to connect to Redis for cluster events")?,
        ),
        None => Arc::new(log_bus()),
    };

    let orchestrator = ClusterOrchestrator::new(
        runtime,
        clusters,
        infrastructures,
        publisher,
        config.orchestrator.clone(),
    );
    Ok(Arc::new(orchestrator))
}

/// Opens the PostgreSQL store and applies pending migrations.
pub async fn connect_store(database: &DatabaseConfig) -> anyhow::Result<PostgresStore> {
    let store = PostgresStore::connect(
        &database.url,
        database.max_connections,
        database.acquire_timeout,
    )
    .await
    .context("failed to connect to PostgreSQL")?;
    store
        .initialize_schema()
        .await
        .context("database migration failed")?;
    Ok(store)
}

/// In-process bus with one subscriber that writes every event to the log.
fn log_bus() -> InProcEventBus {
    let bus = InProcEventBus::default();
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    cluster_id = %event.cluster_id,
                    kind = %event.kind,
                    "cluster event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cluster event log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    bus
}
