//! Provider callback handler.
//!
//! Callbacks feed the same [`JobTracker::observe`](crate::jobs::JobTracker::observe)
//! path as polling, so a replayed callback, or one racing a poll, settles
//! the job at most once.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use dua_ledger_core::{JobState, ProviderKind};

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::providers::ProviderError;
use crate::state::AppState;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Callback response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    /// Whether the callback was processed.
    pub received: bool,
    /// The job it was applied to.
    pub job_id: String,
    /// Job state after the callback.
    pub state: JobState,
    /// Whether the callback changed the job.
    pub changed: bool,
}

/// Handle a provider callback.
pub async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, ApiError> {
    let provider = ProviderKind::parse(&provider)
        .ok_or_else(|| ApiError::NotFound(format!("unknown provider: {provider}")))?;

    if let Some(secret) = &state.config.callback_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::warn!(provider = %provider, "Callback without signature");
                ApiError::Unauthorized
            })?;

        if !verify_signature(secret, &body, signature) {
            tracing::warn!(provider = %provider, "Invalid callback signature");
            return Err(ApiError::Unauthorized);
        }
    } else {
        tracing::warn!(provider = %provider, "Callback secret not configured - skipping signature verification");
    }

    let adapter = state
        .providers
        .get(provider)
        .ok_or_else(|| ApiError::ServiceUnavailable(format!("{provider} is not configured")))?;

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (provider_job_id, observation) =
        adapter.parse_callback(&payload).map_err(|e| match e {
            ProviderError::Rejected { message, .. } => ApiError::BadRequest(message),
            other => ApiError::BadRequest(other.to_string()),
        })?;

    tracing::info!(
        provider = %provider,
        provider_job_id = %provider_job_id,
        state = %observation.state,
        "Received provider callback"
    );

    let job = state
        .store
        .find_job_by_provider_id(provider, &provider_job_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("no job for {provider} task {provider_job_id}"))
        })?;

    let outcome = state.tracker.observe(&job.id, observation).await?;

    Ok(Json(CallbackResponse {
        received: true,
        job_id: outcome.job.id.to_string(),
        state: outcome.job.state,
        changed: outcome.transition.changed(),
    }))
}
