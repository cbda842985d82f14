//! Device signal injection routes.
//!
//! Platform glue feeds network, storage, power, data-change, and package
//! events through these endpoints; the handlers only enqueue messages for
//! the worker and never touch scheduler state.

use axum::{extract::State, response::Json};
use serde::Deserialize;
use tracing::instrument;
use utoipa::ToSchema;

use crate::constraints::StorageLevel;
use crate::data_change::{capability_uris, MediaType};
use crate::error::ApiError;
use crate::handlers::AckResponse;
use crate::server::AppState;

/// Network media whose connectivity changed.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMedium {
    Wifi,
    Cellular,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NetworkSignalRequest {
    pub medium: NetworkMedium,
    pub connected: bool,
}

/// Report a connectivity change.
#[utoipa::path(
    post,
    path = "/signals/network",
    request_body = NetworkSignalRequest,
    responses((status = 200, description = "Signal accepted", body = AckResponse)),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn network(
    State(state): State<AppState>,
    Json(body): Json<NetworkSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    match body.medium {
        NetworkMedium::Wifi => state.handle.wifi_changed(body.connected),
        NetworkMedium::Cellular => state.handle.cellular_changed(body.connected),
    }
    Ok(Json(AckResponse::default()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StorageSignalRequest {
    pub level: StorageLevel,
}

/// Report a storage pressure change.
#[utoipa::path(
    post,
    path = "/signals/storage",
    request_body = StorageSignalRequest,
    responses((status = 200, description = "Signal accepted", body = AckResponse)),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn storage(
    State(state): State<AppState>,
    Json(body): Json<StorageSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.storage_changed(body.level);
    Ok(Json(AckResponse::default()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpsSignalRequest {
    pub enabled: bool,
}

/// Report an ultra-power-saving mode change.
#[utoipa::path(
    post,
    path = "/signals/ups",
    request_body = UpsSignalRequest,
    responses((status = 200, description = "Signal accepted", body = AckResponse)),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn ups(
    State(state): State<AppState>,
    Json(body): Json<UpsSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.ups_mode_changed(body.enabled);
    Ok(Json(AckResponse::default()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DataChangeSignalRequest {
    /// One of the recognized capability URIs.
    pub capability: String,
}

/// Report a change in a device data source (calendar, contacts).
#[utoipa::path(
    post,
    path = "/signals/data-change",
    request_body = DataChangeSignalRequest,
    responses(
        (status = 200, description = "Signal accepted", body = AckResponse),
        (status = 400, description = "Unknown capability", body = ApiError)
    ),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn data_change(
    State(state): State<AppState>,
    Json(body): Json<DataChangeSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    if !capability_uris::is_recognized(&body.capability) {
        return Err(ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "INVALID_PARAMETER",
            "unrecognized capability",
        ));
    }
    state.handle.data_changed(&body.capability);
    Ok(Json(AckResponse::default()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MediaSignalRequest {
    pub media_type: MediaType,
}

/// Report a media store change; the media type selects the capability
/// bucket.
#[utoipa::path(
    post,
    path = "/signals/media",
    request_body = MediaSignalRequest,
    responses((status = 200, description = "Signal accepted", body = AckResponse)),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn media(
    State(state): State<AppState>,
    Json(body): Json<MediaSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.media_changed(body.media_type);
    Ok(Json(AckResponse::default()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PackageSignalRequest {
    pub package_id: String,
}

/// Report a package uninstall; all of the package's scheduler state is
/// released.
#[utoipa::path(
    post,
    path = "/signals/package-uninstalled",
    request_body = PackageSignalRequest,
    responses((status = 200, description = "Signal accepted", body = AckResponse)),
    tag = "signals"
)]
#[instrument(skip(state))]
pub async fn package_uninstalled(
    State(state): State<AppState>,
    Json(body): Json<PackageSignalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state.handle.package_uninstalled(&body.package_id);
    Ok(Json(AckResponse::default()))
}
