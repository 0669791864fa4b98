//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, admin, balance, callbacks, credits, health, invites, jobs};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for job submission. Each one holds a
/// provider call open.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 25;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Ledger (Service API Key auth)
/// - `POST /v1/accounts` - Create a user's balance
/// - `GET /v1/balance?userId=` - Primary and mirror balance
/// - `GET /v1/transactions?userId=` - Transaction history
/// - `POST /v1/invites/redeem` - Redeem an invite code
///
/// ## Synchronous credits (Service API Key auth)
/// - `GET /v1/credits/check?userId=&operation=` - Affordability check
/// - `POST /v1/credits/deduct` - Charge an in-request operation
/// - `GET /v1/credits/stats?userId=` - Spending summary
/// - `GET /v1/credits/operations` - Operation prices
///
/// ## Jobs (Service API Key auth)
/// - `GET /v1/services` - Pricing catalog
/// - `POST /v1/jobs` - Submit a generation job
/// - `GET /v1/jobs/:job_id/status` - Job state
/// - `GET /v1/jobs/:job_id` - Full job record
///
/// ## End user (JWT auth)
/// - `GET /v1/me/balance`
/// - `GET /v1/me/transactions`
/// - `GET /v1/me/stats`
///
/// ## Admin (Admin API Key auth)
/// - `POST /v1/admin/credits`, `/balance`, `/mirror`
/// - `POST /v1/admin/reconcile/:user_id`
/// - `POST /v1/admin/invites`
/// - `POST /v1/admin/sweep`
///
/// ## Callbacks (Signature verification)
/// - `POST /webhooks/:provider`
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let job_routes = Router::new()
        .route("/", post(jobs::submit_job))
        .route("/:job_id", get(jobs::get_job))
        .route("/:job_id/status", get(jobs::get_job_status))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    let credit_routes = Router::new()
        .route("/check", get(credits::check_credits))
        .route("/deduct", post(credits::deduct_credits))
        .route("/stats", get(credits::get_stats))
        .route("/operations", get(credits::list_operations));

    let admin_routes = Router::new()
        .route("/credits", post(admin::grant_credits))
        .route("/balance", post(admin::set_balance))
        .route("/mirror", post(admin::set_mirror_balance))
        .route("/reconcile/:user_id", post(admin::reconcile_mirror))
        .route("/invites", post(admin::create_invites))
        .route("/sweep", post(admin::run_sweep));

    let api_routes = Router::new()
        // Ledger
        .route("/accounts", post(accounts::create_account))
        .route("/balance", get(balance::get_balance))
        .route("/transactions", get(balance::list_transactions))
        .route("/invites/redeem", post(invites::redeem_invite))
        .nest("/credits", credit_routes)
        // End user
        .route("/me/balance", get(balance::get_my_balance))
        .route("/me/transactions", get(balance::list_my_transactions))
        .route("/me/stats", get(credits::get_my_stats))
        // Jobs
        .route("/services", get(jobs::list_services))
        .nest("/jobs", job_routes)
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Provider callbacks (no rate limit - controlled by providers)
        .route("/webhooks/:provider", post(callbacks::provider_callback))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(request_timeout_seconds)))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
