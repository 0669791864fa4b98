//! Generation job handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dua_ledger_core::{GenerationJob, JobId, JobState, ServiceSpec, UserId};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::jobs::SubmitJob;
use crate::state::AppState;

/// Submit job request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Paying user.
    pub user_id: UserId,
    /// Catalog service code, e.g. `music_generate_v5`.
    pub service_type: String,
    /// Provider-specific generation parameters.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Full job record.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    /// Internal job ID.
    pub job_id: String,
    /// Provider task ID, once dispatched.
    pub provider_job_id: Option<String>,
    /// Owner.
    pub user_id: String,
    /// Catalog service code.
    pub service_type: String,
    /// Provider.
    pub provider: String,
    /// Units reserved at submission.
    pub cost_reserved: i64,
    /// Lifecycle state.
    pub state: JobState,
    /// Result artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Status polls made so far.
    pub poll_attempts: u32,
    /// Submission time.
    pub created_at: String,
    /// Last change.
    pub updated_at: String,
    /// When settlement completed.
    pub settled_at: Option<String>,
}

impl From<&GenerationJob> for JobResponse {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id.to_string(),
            provider_job_id: job.provider_job_id.as_ref().map(ToString::to_string),
            user_id: job.user_id.to_string(),
            service_type: job.service_code.clone(),
            provider: job.provider.to_string(),
            cost_reserved: job.cost_reserved,
            state: job.state,
            result_payload: job.result_payload.clone(),
            failure_reason: job.failure_reason.clone(),
            poll_attempts: job.poll_attempts,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            settled_at: job.settled_at.map(|at| at.to_rfc3339()),
        }
    }
}

/// Job status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    /// Internal job ID.
    pub job_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Result artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&GenerationJob> for JobStatusResponse {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id.to_string(),
            state: job.state,
            result_payload: job.result_payload.clone(),
            failure_reason: job.failure_reason.clone(),
        }
    }
}

/// Submit a generation job.
///
/// Responds `202 Accepted` once credits are reserved and the provider has
/// accepted the job; progress is tracked server-side.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    tracing::debug!(
        user_id = %body.user_id,
        service_type = %body.service_type,
        service = %auth.service_name,
        "Job submission"
    );

    let job = state
        .submitter
        .submit(SubmitJob {
            user_id: body.user_id,
            service_code: body.service_type,
            params: body.params,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(JobResponse::from(&job))))
}

/// Current state of a job.
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = load_job(&state, &job_id).await?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// Full job record.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = load_job(&state, &job_id).await?;
    Ok(Json(JobResponse::from(&job)))
}

async fn load_job(state: &AppState, job_id: &str) -> Result<GenerationJob, ApiError> {
    let job_id = job_id
        .parse::<JobId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {job_id}")))?;

    state
        .store
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))
}

/// Catalog entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    /// Service code.
    pub service_type: String,
    /// Display name.
    pub name: String,
    /// Provider.
    pub provider: String,
    /// Provider model.
    pub model: String,
    /// Clip duration for video services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    /// Units charged.
    pub cost: i64,
    /// Whether the provider is configured on this deployment.
    pub available: bool,
}

/// List priced services.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
) -> Json<Vec<ServiceResponse>> {
    let services = state
        .config
        .pricing
        .iter()
        .map(|spec: &ServiceSpec| ServiceResponse {
            service_type: spec.code.clone(),
            name: spec.name.clone(),
            provider: spec.provider.to_string(),
            model: spec.model.clone(),
            duration_secs: spec.duration_secs,
            cost: spec.cost,
            available: state.providers.get(spec.provider).is_some(),
        })
        .collect();

    Json(services)
}
