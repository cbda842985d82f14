//! Sync job request handlers: on-demand, periodic, and data-change job
//! creation, removal, and listing.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;

use crate::bundle::Bundle;
use crate::error::ApiError;
use crate::facade::JobSummary;
use crate::handlers::AckResponse;
use crate::models::account::NO_ACCOUNT;
use crate::server::AppState;

fn default_account_id() -> i32 {
    NO_ACCOUNT
}

/// Public periodic intervals. All values coerce to seconds; the scheduler
/// applies its own 300 s floor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub enum SyncInterval {
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "10min")]
    TenMinutes,
    #[serde(rename = "15min")]
    FifteenMinutes,
    #[serde(rename = "20min")]
    TwentyMinutes,
    #[serde(rename = "30min")]
    ThirtyMinutes,
    #[serde(rename = "45min")]
    FortyFiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl SyncInterval {
    pub fn seconds(self) -> i64 {
        let minutes = match self {
            SyncInterval::FiveMinutes => 5,
            SyncInterval::TenMinutes => 10,
            SyncInterval::FifteenMinutes => 15,
            SyncInterval::TwentyMinutes => 20,
            SyncInterval::ThirtyMinutes => 30,
            SyncInterval::FortyFiveMinutes => 45,
            SyncInterval::OneHour => 60,
            SyncInterval::TwoHours => 2 * 60,
            SyncInterval::ThreeHours => 3 * 60,
            SyncInterval::SixHours => 6 * 60,
            SyncInterval::TwelveHours => 12 * 60,
            SyncInterval::OneDay => 24 * 60,
        };
        minutes * 60
    }
}

/// Reply carrying the per-package job id.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobCreatedResponse {
    pub sync_job_id: i32,
}

/// Request payload for a run-once sync job.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OnDemandJobRequest {
    pub package_id: String,
    /// `-1` for an account-less job.
    #[serde(default = "default_account_id")]
    pub account_id: i32,
    pub job_name: String,
    /// Bitfield: `0x01` expedited, `0x02` no-retry.
    #[serde(default)]
    pub sync_option: u32,
    #[serde(default)]
    pub extras: Bundle,
}

/// Request a sync to run once, as soon as constraints allow.
#[utoipa::path(
    post,
    path = "/jobs/on-demand",
    request_body = OnDemandJobRequest,
    responses(
        (status = 200, description = "Job accepted", body = JobCreatedResponse),
        (status = 400, description = "Invalid parameter", body = ApiError),
        (status = 404, description = "No adapter registered", body = ApiError),
        (status = 429, description = "Job id quota exceeded", body = ApiError)
    ),
    tag = "jobs"
)]
#[instrument(skip(state, body), fields(package_id = %body.package_id, job_name = %body.job_name))]
pub async fn add_on_demand(
    State(state): State<AppState>,
    Json(body): Json<OnDemandJobRequest>,
) -> Result<Json<JobCreatedResponse>, ApiError> {
    let sync_job_id = state
        .handle
        .add_on_demand_sync_job(
            &body.package_id,
            body.account_id,
            &body.job_name,
            body.sync_option,
            body.extras,
        )
        .await?;
    Ok(Json(JobCreatedResponse { sync_job_id }))
}

/// Request payload for a periodic sync job. Either a public `interval` tag
/// or a raw `period_sec` must be given.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PeriodicJobRequest {
    pub package_id: String,
    #[serde(default = "default_account_id")]
    pub account_id: i32,
    pub job_name: String,
    #[serde(default)]
    pub interval: Option<SyncInterval>,
    #[serde(default)]
    pub period_sec: Option<i64>,
    #[serde(default)]
    pub sync_option: u32,
    #[serde(default)]
    pub extras: Bundle,
}

/// Register a sync to run approximately every N seconds.
#[utoipa::path(
    post,
    path = "/jobs/periodic",
    request_body = PeriodicJobRequest,
    responses(
        (status = 200, description = "Job registered", body = JobCreatedResponse),
        (status = 400, description = "Invalid parameter", body = ApiError),
        (status = 404, description = "No adapter registered", body = ApiError),
        (status = 429, description = "Job id quota exceeded", body = ApiError)
    ),
    tag = "jobs"
)]
#[instrument(skip(state, body), fields(package_id = %body.package_id, job_name = %body.job_name))]
pub async fn add_periodic(
    State(state): State<AppState>,
    Json(body): Json<PeriodicJobRequest>,
) -> Result<Json<JobCreatedResponse>, ApiError> {
    let period_sec = match (body.period_sec, body.interval) {
        (Some(seconds), _) => seconds,
        (None, Some(interval)) => interval.seconds(),
        (None, None) => {
            return Err(ApiError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "INVALID_PARAMETER",
                "either period_sec or interval is required",
            ));
        }
    };
    let sync_job_id = state
        .handle
        .add_periodic_sync_job(
            &body.package_id,
            body.account_id,
            &body.job_name,
            period_sec,
            body.sync_option,
            body.extras,
        )
        .await?;
    Ok(Json(JobCreatedResponse { sync_job_id }))
}

/// Request payload for a data-change sync job.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DataChangeJobRequest {
    pub package_id: String,
    #[serde(default = "default_account_id")]
    pub account_id: i32,
    /// One of the recognized capability URIs.
    pub capability: String,
    #[serde(default)]
    pub sync_option: u32,
    #[serde(default)]
    pub extras: Bundle,
}

/// Register a sync that runs whenever the named device data source changes.
#[utoipa::path(
    post,
    path = "/jobs/data-change",
    request_body = DataChangeJobRequest,
    responses(
        (status = 200, description = "Job registered", body = JobCreatedResponse),
        (status = 400, description = "Unknown capability", body = ApiError),
        (status = 404, description = "No adapter registered", body = ApiError),
        (status = 429, description = "Job id quota exceeded", body = ApiError)
    ),
    tag = "jobs"
)]
#[instrument(skip(state, body), fields(package_id = %body.package_id, capability = %body.capability))]
pub async fn add_data_change(
    State(state): State<AppState>,
    Json(body): Json<DataChangeJobRequest>,
) -> Result<Json<JobCreatedResponse>, ApiError> {
    let sync_job_id = state
        .handle
        .add_data_change_sync_job(
            &body.package_id,
            body.account_id,
            &body.capability,
            body.sync_option,
            body.extras,
        )
        .await?;
    Ok(Json(JobCreatedResponse { sync_job_id }))
}

/// Query parameters identifying the calling package.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PackageQuery {
    pub package_id: String,
}

/// Remove a previously requested sync job by id.
#[utoipa::path(
    delete,
    path = "/jobs/{sync_job_id}",
    params(
        ("sync_job_id" = i32, Path, description = "Id returned when the job was added"),
        PackageQuery
    ),
    responses(
        (status = 200, description = "Job removed", body = AckResponse),
        (status = 400, description = "Id out of range", body = ApiError)
    ),
    tag = "jobs"
)]
#[instrument(skip(state))]
pub async fn remove(
    State(state): State<AppState>,
    Path(sync_job_id): Path<i32>,
    Query(query): Query<PackageQuery>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .handle
        .remove_sync_job(&query.package_id, sync_job_id)
        .await?;
    Ok(Json(AckResponse::default()))
}

/// List every sync job registered by the calling package.
#[utoipa::path(
    get,
    path = "/jobs",
    params(PackageQuery),
    responses(
        (status = 200, description = "Registered jobs", body = [JobSummary])
    ),
    tag = "jobs"
)]
#[instrument(skip(state))]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<PackageQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let jobs = state.handle.get_all_sync_jobs(&query.package_id).await?;
    Ok(Json(jobs))
}
