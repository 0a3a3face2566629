use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Configured worker count.
    pub workers: usize,
    /// Hooks currently running.
    pub running: usize,
}

/// GET /healthz -- returns service status and worker usage.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hooks.stats();
    let status = if state.hooks.is_shutting_down() {
        "stopping"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        workers: stats.workers,
        running: stats.running,
    })
}

/// Mount health check routes (not subject to authentication).
pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(health_check))
}
