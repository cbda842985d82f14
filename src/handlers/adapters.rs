//! Adapter registration and adapter-side result delivery.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use tracing::instrument;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::handlers::AckResponse;
use crate::models::SyncStatus;
use crate::server::AppState;

/// Request payload for registering a sync adapter.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterAdapterRequest {
    /// Installed package that owns the adapter.
    pub package_id: String,
    /// Service application performing the actual sync work.
    pub service_app_id: String,
}

/// Register a sync adapter for a package. Registering the same pair twice
/// is a no-op.
#[utoipa::path(
    post,
    path = "/adapters",
    request_body = RegisterAdapterRequest,
    responses(
        (status = 200, description = "Adapter registered", body = AckResponse),
        (status = 400, description = "Missing package or service id", body = ApiError)
    ),
    tag = "adapters"
)]
#[instrument(skip(state))]
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterAdapterRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .handle
        .register_adapter(&body.package_id, &body.service_app_id)
        .await?;
    Ok(Json(AckResponse::default()))
}

/// Unregister the sync adapter of a package.
#[utoipa::path(
    delete,
    path = "/adapters/{package_id}",
    params(("package_id" = String, Path, description = "Package whose adapter is removed")),
    responses(
        (status = 200, description = "Adapter unregistered", body = AckResponse),
        (status = 409, description = "No adapter registered for the package", body = ApiError)
    ),
    tag = "adapters"
)]
#[instrument(skip(state))]
pub async fn unregister(
    State(state): State<AppState>,
    Path(package_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.unregister_adapter(&package_id).await?;
    Ok(Json(AckResponse::default()))
}

/// Result payload sent by an adapter after working on a dispatched job.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncResultRequest {
    /// Package of the reporting adapter.
    pub package_id: String,
    /// Name of the job the result belongs to.
    pub job_name: String,
    /// Wire code: 0 success, -1 cancelled, -2 already in progress, -3 failure.
    pub sync_status: i32,
}

/// Deliver an adapter's sync result to the scheduler.
#[utoipa::path(
    post,
    path = "/results",
    request_body = SyncResultRequest,
    responses(
        (status = 200, description = "Result accepted", body = AckResponse)
    ),
    tag = "adapters"
)]
#[instrument(skip(state))]
pub async fn send_result(
    State(state): State<AppState>,
    Json(body): Json<SyncResultRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let status = SyncStatus::from_code(body.sync_status);
    state
        .handle
        .send_result(&body.package_id, &body.job_name, status)
        .await?;
    Ok(Json(AckResponse::default()))
}
