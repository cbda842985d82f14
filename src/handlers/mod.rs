//! # API Handlers
//!
//! HTTP endpoint handlers for the sync scheduler daemon's request surface.

pub mod adapters;
pub mod jobs;
pub mod signals;
pub mod status;

use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

/// Acknowledgement body for requests without a richer reply.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AckResponse {
    /// Outcome marker, always `"ok"`.
    pub status: String,
}

impl Default for AckResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root(State(_state): State<AppState>) -> Result<Json<ServiceInfo>, ApiError> {
    Ok(Json(ServiceInfo::default()))
}

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service identifier
    pub service: String,
    /// Service version
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            service: "syncd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health check endpoint (liveness probe, no dependency checks)
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(_state: State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse::default()))
}
