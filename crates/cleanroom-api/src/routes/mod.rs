//! API routes.

pub mod health;
pub mod jobs;

use crate::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;

/// Build the main API router. Uploads larger than `max_upload_bytes` are rejected.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .nest("/api/v1/jobs", jobs::router())
        .merge(health::router())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}
