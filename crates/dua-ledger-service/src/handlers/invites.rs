//! Invite code redemption.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use dua_ledger_core::{InviteCode, UserId};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Redeem request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemInviteRequest {
    /// Code as typed by the user.
    pub code: String,
    /// Redeeming user. Gets a balance if they don't have one yet.
    pub user_id: UserId,
}

/// Redeem response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemInviteResponse {
    /// Normalised code.
    pub code: String,
    /// Redeeming user.
    pub user_id: String,
    /// Units granted.
    pub credited_units: i64,
    /// Balance after the grant.
    pub balance: i64,
}

/// Redeem a single-use invite code.
pub async fn redeem_invite(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(body): Json<RedeemInviteRequest>,
) -> Result<Json<RedeemInviteResponse>, ApiError> {
    let code = InviteCode::normalize(&body.code)?;

    let redemption = state
        .store
        .redeem_invite(&code, &body.user_id, state.config.invite_welcome_units)
        .await?;

    let credited_units = redemption
        .transaction
        .as_ref()
        .map_or(0, |tx| tx.amount_delta);

    tracing::info!(
        code = %redemption.invite.code,
        user_id = %body.user_id,
        credited_units = credited_units,
        balance = redemption.balance,
        "Invite code redeemed"
    );

    Ok(Json(RedeemInviteResponse {
        code: redemption.invite.code,
        user_id: body.user_id.to_string(),
        credited_units,
        balance: redemption.balance,
    }))
}
