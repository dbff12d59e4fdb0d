//! Application state.

use cleanroom_scheduler::JobService;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jobs: Arc<JobService>,
}

impl AppState {
    pub fn new(pool: PgPool, jobs: Arc<JobService>) -> Self {
        Self { pool, jobs }
    }
}
