//! Keelson HTTP control plane.

pub mod api;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod startup;
pub mod state;

pub use state::AppState;
