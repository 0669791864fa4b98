//! Account registration.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use dua_ledger_core::UserId;

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::handlers::balance::{balance_of, BalanceResponse};
use crate::state::AppState;

/// Create account request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    /// The new user.
    pub user_id: UserId,
    /// Opening balance, recorded as a credit.
    #[serde(default)]
    pub initial_units: i64,
}

/// Create the balance rows for a new user.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<BalanceResponse>), ApiError> {
    state
        .store
        .create_balance(&body.user_id, body.initial_units)
        .await?;

    tracing::info!(
        user_id = %body.user_id,
        initial_units = body.initial_units,
        service = %auth.service_name,
        "Account created"
    );

    let balance = balance_of(&state, &body.user_id).await?;
    Ok((StatusCode::CREATED, Json(balance)))
}
