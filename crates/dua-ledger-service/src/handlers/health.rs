//! Liveness and readiness.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the store is unreachable.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: &'static str,
    /// `ok` or `unavailable`.
    pub store: &'static str,
    /// Providers with a working adapter, sorted.
    pub providers: Vec<String>,
    /// Jobs with a live poll task on this instance.
    pub tracked_jobs: usize,
}

/// Health check. Answers 503 when the store does not respond, so a load
/// balancer stops routing ledger writes here.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Health check: store unavailable");
            false
        }
    };

    let mut providers: Vec<String> = state.providers.kinds().map(|k| k.to_string()).collect();
    providers.sort_unstable();

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if store_ok { "ok" } else { "degraded" },
        service: "dua-ledger",
        version: env!("CARGO_PKG_VERSION"),
        store: if store_ok { "ok" } else { "unavailable" },
        providers,
        tracked_jobs: state.tracker.tracked_count(),
    };
    (status, Json(body))
}
