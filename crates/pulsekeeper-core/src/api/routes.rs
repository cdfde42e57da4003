//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Jobs
        .route("/api/v1/jobs", get(handlers::list_jobs))
        .route("/api/v1/jobs/:name/run", post(handlers::run_job))
        .with_state(state)
}
