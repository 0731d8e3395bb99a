pub mod v1;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers::health::health;

/// Full application router: versioned API plus the health probe.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1::create_v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
