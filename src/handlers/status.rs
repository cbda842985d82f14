//! Global sync on/off switch.

use axum::{extract::State, response::Json};
use serde::Deserialize;
use tracing::instrument;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::handlers::AckResponse;
use crate::server::AppState;

/// Request payload for the global sync switch.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncStatusRequest {
    pub enabled: bool,
}

/// Pause or resume all sync dispatching.
#[utoipa::path(
    put,
    path = "/sync-status",
    request_body = SyncStatusRequest,
    responses(
        (status = 200, description = "Sync status updated", body = AckResponse)
    ),
    tag = "status"
)]
#[instrument(skip(state))]
pub async fn set_sync_status(
    State(state): State<AppState>,
    Json(body): Json<SyncStatusRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.set_sync_status(body.enabled).await?;
    Ok(Json(AckResponse::default()))
}
