//! Admin handlers.
//!
//! Every write here is audited: the `x-admin-id` header ends up on the
//! `adjustment` transaction the store records.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use dua_ledger_core::{InviteCode, Transaction, UserId};
use dua_ledger_store::SyncOutcome;

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::handlers::balance::{balance_of, BalanceResponse, TransactionResponse};
use crate::jobs::{sweep, SweepReport};
use crate::state::AppState;

/// Most codes a single generate request may create.
const MAX_GENERATED_INVITES: usize = 500;

/// Largest grant or absolute balance an admin may write in one request.
pub const MAX_ADMIN_UNITS: i64 = 1_000_000_000;

/// Length of the random part of generated invite codes.
const GENERATED_CODE_LEN: usize = 8;

fn check_admin_units(units: i64) -> Result<(), ApiError> {
    if units > MAX_ADMIN_UNITS {
        return Err(ApiError::BadRequest(format!(
            "units must not exceed {MAX_ADMIN_UNITS}, got {units}"
        )));
    }
    Ok(())
}

/// Balance change response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentResponse {
    /// The recorded transaction.
    pub transaction: TransactionResponse,
    /// Balances after the change.
    pub balance: BalanceResponse,
}

impl AdjustmentResponse {
    async fn build(state: &AppState, tx: &Transaction) -> Result<Self, ApiError> {
        Ok(Self {
            transaction: TransactionResponse::from(tx),
            balance: balance_of(state, &tx.user_id).await?,
        })
    }
}

/// Grant credits request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreditsRequest {
    /// Receiving user.
    pub user_id: UserId,
    /// Units to add.
    pub units: i64,
    /// Reason recorded on the transaction.
    pub reason: Option<String>,
}

/// Add credits to a user (promotions, support, manual top-ups).
pub async fn grant_credits(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<GrantCreditsRequest>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    check_admin_units(body.units)?;
    let reason = body
        .reason
        .unwrap_or_else(|| format!("admin_grant:{}", auth.admin_id));
    let tx = state
        .store
        .credit(&body.user_id, body.units, &reason, None)
        .await?;

    tracing::info!(
        user_id = %body.user_id,
        units = body.units,
        admin_id = %auth.admin_id,
        balance = tx.balance_after,
        "Admin granted credits"
    );

    AdjustmentResponse::build(&state, &tx).await.map(Json)
}

/// Set balance request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBalanceRequest {
    /// Target user.
    pub user_id: UserId,
    /// New absolute balance.
    pub units: i64,
    /// Why the balance is being overwritten.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Overwrite a user's primary balance.
pub async fn set_balance(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<SetBalanceRequest>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    check_admin_units(body.units)?;
    let reason = body.reason.as_deref().unwrap_or("admin_set_balance");
    let tx = state
        .store
        .admin_set_balance(&body.user_id, body.units, &auth.admin_id, reason)
        .await?;

    tracing::info!(
        user_id = %body.user_id,
        units = body.units,
        delta = tx.amount_delta,
        admin_id = %auth.admin_id,
        "Admin set balance"
    );

    AdjustmentResponse::build(&state, &tx).await.map(Json)
}

/// Write the mirror table directly, as the legacy admin tool does. The
/// primary balance follows.
pub async fn set_mirror_balance(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<SetBalanceRequest>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    check_admin_units(body.units)?;
    let tx = state
        .store
        .admin_set_mirror_balance(&body.user_id, body.units, &auth.admin_id)
        .await?;

    tracing::info!(
        user_id = %body.user_id,
        units = body.units,
        admin_id = %auth.admin_id,
        "Admin wrote mirror balance"
    );

    AdjustmentResponse::build(&state, &tx).await.map(Json)
}

/// Check and repair a user's mirror balance.
pub async fn reconcile_mirror(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<SyncOutcome>, ApiError> {
    let user_id = user_id
        .parse::<UserId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid user id: {user_id}")))?;

    let outcome = state.store.reconcile_mirror(&user_id).await?;
    Ok(Json(outcome))
}

/// Create invites request: explicit codes, generated ones, or both.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitesRequest {
    /// Codes to create as given.
    #[serde(default)]
    pub codes: Vec<String>,
    /// Number of random codes to generate.
    #[serde(default)]
    pub count: usize,
    /// Prefix for generated codes.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Created invite codes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitesResponse {
    /// Codes created by this request. Codes that already existed are
    /// left out.
    pub codes: Vec<String>,
}

/// Issue invite codes.
pub async fn create_invites(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<CreateInvitesRequest>,
) -> Result<Json<CreateInvitesResponse>, ApiError> {
    if body.count > MAX_GENERATED_INVITES {
        return Err(ApiError::BadRequest(format!(
            "count must be at most {MAX_GENERATED_INVITES}"
        )));
    }

    let mut invites = body
        .codes
        .iter()
        .map(|code| InviteCode::issue(code))
        .collect::<Result<Vec<_>, _>>()?;
    for _ in 0..body.count {
        invites.push(InviteCode::issue(&generate_code(body.prefix.as_deref()))?);
    }
    if invites.is_empty() {
        return Err(ApiError::BadRequest("no codes requested".into()));
    }

    let created = state.store.create_invites(&invites).await?;

    tracing::info!(
        requested = invites.len(),
        created = created.len(),
        admin_id = %auth.admin_id,
        "Invite codes issued"
    );

    Ok(Json(CreateInvitesResponse {
        codes: created.into_iter().map(|invite| invite.code).collect(),
    }))
}

/// A random code from the entropy bits of a fresh ULID.
fn generate_code(prefix: Option<&str>) -> String {
    let ulid = ulid::Ulid::new().to_string();
    let random = &ulid[ulid.len() - GENERATED_CODE_LEN..];
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}-{random}"),
        None => random.to_string(),
    }
}

/// Run the reconciliation sweep now.
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
) -> Result<Json<SweepReport>, ApiError> {
    let report = sweep(&state.tracker).await?;
    tracing::info!(
        admin_id = %auth.admin_id,
        timed_out = report.timed_out,
        resumed = report.resumed,
        settled = report.settled,
        "Manual sweep completed"
    );
    Ok(Json(report))
}
