//! # Server Configuration
//!
//! Axum router wiring for the sync scheduler daemon's request surface.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::facade::SchedulerHandle;
use crate::handlers;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub handle: SchedulerHandle,
    pub config: Arc<AppConfig>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health))
        .route("/adapters", post(handlers::adapters::register))
        .route(
            "/adapters/{package_id}",
            delete(handlers::adapters::unregister),
        )
        .route("/results", post(handlers::adapters::send_result))
        .route("/jobs", get(handlers::jobs::list))
        .route("/jobs/on-demand", post(handlers::jobs::add_on_demand))
        .route("/jobs/periodic", post(handlers::jobs::add_periodic))
        .route("/jobs/data-change", post(handlers::jobs::add_data_change))
        .route("/jobs/{sync_job_id}", delete(handlers::jobs::remove))
        .route("/sync-status", put(handlers::status::set_sync_status))
        .route("/signals/network", post(handlers::signals::network))
        .route("/signals/storage", post(handlers::signals::storage))
        .route("/signals/ups", post(handlers::signals::ups))
        .route("/signals/data-change", post(handlers::signals::data_change))
        .route("/signals/media", post(handlers::signals::media))
        .route(
            "/signals/package-uninstalled",
            post(handlers::signals::package_uninstalled),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration, shutting down when the
/// token fires.
pub async fn run_server(
    config: Arc<AppConfig>,
    handle: SchedulerHandle,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let state = AppState {
        handle,
        config: config.clone(),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::adapters::register,
        crate::handlers::adapters::unregister,
        crate::handlers::adapters::send_result,
        crate::handlers::jobs::list,
        crate::handlers::jobs::add_on_demand,
        crate::handlers::jobs::add_periodic,
        crate::handlers::jobs::add_data_change,
        crate::handlers::jobs::remove,
        crate::handlers::status::set_sync_status,
        crate::handlers::signals::network,
        crate::handlers::signals::storage,
        crate::handlers::signals::ups,
        crate::handlers::signals::data_change,
        crate::handlers::signals::media,
        crate::handlers::signals::package_uninstalled,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::AckResponse,
            crate::handlers::HealthResponse,
            crate::handlers::jobs::JobCreatedResponse,
            crate::facade::JobSummary,
            crate::bundle::Bundle,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Sync Scheduler Daemon API",
        description = "Request surface of the system sync scheduler",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
