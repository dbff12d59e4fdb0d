//! Cleanroom API Server

use anyhow::Context;
use cleanroom_api::{AppState, routes};
use cleanroom_cloud::GcpProvider;
use cleanroom_config::{DEFAULT_CONFIG_PATH, load_system_config};
use cleanroom_db::{PgJobRepo, create_pool, run_migrations};
use cleanroom_runner::KubernetesJobRunner;
use cleanroom_scheduler::JobService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("CLEANROOM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_system_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    info!("Connecting to database...");
    let pool = create_pool(&config.api.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let cloud = Arc::new(GcpProvider::new(config.cloud.clone())?);
    let runner = Arc::new(KubernetesJobRunner::new(config.cluster.namespace.clone()).await?);
    let repo = Arc::new(PgJobRepo::new(pool.clone()));
    let jobs = Arc::new(JobService::new(repo, cloud, runner, config.clone()));

    let state = AppState::new(pool, jobs);

    let app = routes::router(state, config.api.max_upload_bytes).layer(
        ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        ),
    );

    info!(listen = %config.api.listen, "Starting server");
    let listener = TcpListener::bind(&config.api.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
