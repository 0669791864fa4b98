//! Synchronous credit handlers.
//!
//! Operations that finish inside the caller's own request are charged here
//! with one conditional deduction. Nothing is tracked afterwards, so there
//! is no refund path: callers check first, run the operation, then deduct.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use dua_ledger_core::{OperationCategory, UserId};
use dua_ledger_store::CreditStats;

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::handlers::balance::TransactionResponse;
use crate::state::AppState;

/// Header carrying the balance after a deduction.
pub const BALANCE_HEADER: &str = "x-credits-balance";

/// Header carrying the units a deduction removed.
pub const DEDUCTED_HEADER: &str = "x-credits-deducted";

/// Affordability query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckQuery {
    /// User to check.
    pub user_id: UserId,
    /// Operation or service code.
    pub operation: String,
}

/// Affordability response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    /// User ID.
    pub user_id: String,
    /// Operation or service code.
    pub operation: String,
    /// Units the operation costs.
    pub required: i64,
    /// Current balance, zero for unknown users.
    pub balance: i64,
    /// Units missing, zero when affordable.
    pub deficit: i64,
    /// Whether the balance covers the cost.
    pub has_credits: bool,
    /// Whether the operation costs nothing.
    pub is_free: bool,
}

/// Check whether a user can afford an operation.
///
/// Accepts job service codes as well, so clients can check before
/// submitting a job.
pub async fn check_credits(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, ApiError> {
    let required = state.config.pricing.cost_of(&query.operation)?;
    let balance = state
        .store
        .get_balance(&query.user_id)
        .await?
        .map_or(0, |b| b.spendable_units);
    let deficit = (required - balance).max(0);

    Ok(Json(CheckResponse {
        user_id: query.user_id.to_string(),
        operation: query.operation,
        required,
        balance,
        deficit,
        has_credits: deficit == 0,
        is_free: required == 0,
    }))
}

/// Deduct request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductRequest {
    /// User to charge.
    pub user_id: UserId,
    /// Synchronous operation code.
    pub operation: String,
}

/// Deduct response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductResponse {
    /// Ledger row, absent for free operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Operation code.
    pub operation: String,
    /// Units removed.
    pub cost: i64,
    /// Balance after the deduction.
    pub balance: i64,
}

/// Charge a synchronous operation.
///
/// Job service codes are refused: they must go through `/v1/jobs` so the
/// reservation can be refunded.
pub async fn deduct_credits(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<DeductRequest>,
) -> Result<([(&'static str, String); 2], Json<DeductResponse>), ApiError> {
    let price = state.config.pricing.operation(&body.operation)?;

    let (transaction_id, balance) = if price.is_free() {
        let balance = state
            .store
            .get_balance(&body.user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Balance not found".into()))?;
        (None, balance.spendable_units)
    } else {
        let tx = state
            .store
            .try_deduct(&body.user_id, price.cost, &price.code, None)
            .await?;
        (Some(tx.id.to_string()), tx.balance_after)
    };

    tracing::info!(
        service = %auth.service_name,
        user_id = %body.user_id,
        operation = %price.code,
        cost = price.cost,
        balance,
        "Credits deducted"
    );

    Ok((
        [
            (BALANCE_HEADER, balance.to_string()),
            (DEDUCTED_HEADER, price.cost.to_string()),
        ],
        Json(DeductResponse {
            transaction_id,
            operation: price.code.clone(),
            cost: price.cost,
            balance,
        }),
    ))
}

/// Priced synchronous operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    /// Operation code.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Product area.
    pub category: OperationCategory,
    /// Units per call.
    pub cost: i64,
}

/// List synchronous operation prices.
pub async fn list_operations(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
) -> Json<Vec<OperationResponse>> {
    let operations = state
        .config
        .pricing
        .operations()
        .map(|price| OperationResponse {
            code: price.code.clone(),
            name: price.name.clone(),
            category: price.category,
            cost: price.cost,
        })
        .collect();

    Json(operations)
}

/// Stats query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    /// User to summarize.
    pub user_id: UserId,
}

/// Spending summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// User ID.
    pub user_id: String,
    /// Units spent on deductions.
    pub total_spent: i64,
    /// Units refunded.
    pub total_refunded: i64,
    /// Ledger rows of any kind.
    pub transaction_count: u64,
    /// Newest ledger row.
    pub last_transaction: Option<TransactionResponse>,
}

impl StatsResponse {
    fn new(user_id: &UserId, stats: &CreditStats) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_spent: stats.total_spent,
            total_refunded: stats.total_refunded,
            transaction_count: stats.transaction_count,
            last_transaction: stats.last_transaction.as_ref().map(TransactionResponse::from),
        }
    }
}

/// Spending summary for any user.
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.credit_stats(&query.user_id).await?;
    Ok(Json(StatsResponse::new(&query.user_id, &stats)))
}

/// Spending summary for the caller.
pub async fn get_my_stats(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.credit_stats(&auth.user_id).await?;
    Ok(Json(StatsResponse::new(&auth.user_id, &stats)))
}
