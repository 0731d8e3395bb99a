use std::fmt;
use std::sync::Arc;

use keelson_core::ClusterService;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub clusters: Arc<dyn ClusterService>,
    /// Cancelled on shutdown; long-running operations observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(clusters: Arc<dyn ClusterService>, shutdown: CancellationToken) -> Self {
        Self { clusters, shutdown }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
