//! Keelson core: the PostgreSQL replication orchestrator and its ports.
#![allow(missing_docs)]

/// Error types shared by the orchestrator and its callers
pub mod error;

/// Cluster lifecycle notifications
pub mod events;

/// Sequencing of cluster provisioning, lifecycle, scaling, and failover
pub mod orchestrator;

/// Container runtime gateway and its Docker CLI implementation
pub mod runtime;

/// Persistence ports and adapters
pub mod store;

/// Scripted runtime double used by the test suites
#[doc(hidden)]
pub mod testing;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{ClusterError, Result};
pub use events::{
    ClusterEvent, ClusterEventKind, EventNotifier, EventPublisher,
    InProcEventBus, LoggingPublisher,
};
#[cfg(feature = "database")]
pub use events::RedisEventPublisher;
pub use orchestrator::{
    ClusterLocks, ClusterOrchestrator, ClusterService, OrchestratorConfig,
    ReadinessPolicy,
};
pub use runtime::{ContainerRuntime, DockerCli, RuntimeError};
pub use store::{ClusterStore, InMemoryStore, InfrastructureStore, StoreError};
#[cfg(feature = "database")]
pub use store::PostgresStore;

pub use keelson_model as model;
