use axum::Router;
use axum::routing::{get, post};

use crate::AppState;
use crate::handlers::clusters;

pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/clusters", post(clusters::create_cluster))
        .route(
            "/clusters/{id}",
            get(clusters::get_cluster).delete(clusters::delete_cluster),
        )
        .route("/clusters/{id}/start", post(clusters::start_cluster))
        .route("/clusters/{id}/stop", post(clusters::stop_cluster))
        .route("/clusters/{id}/restart", post(clusters::restart_cluster))
        .route("/clusters/{id}/scale", post(clusters::scale_cluster))
        .route("/clusters/{id}/failover", post(clusters::promote_replica))
        .route(
            "/clusters/{id}/replication",
            get(clusters::replication_status),
        )
        .route("/clusters/{id}/stats", get(clusters::cluster_stats))
        .route("/clusters/{id}/logs", get(clusters::cluster_logs))
}
