//! Balance and transaction history handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use dua_ledger_core::{Transaction, UserId};

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// Largest page size for transaction listings.
const MAX_PAGE_SIZE: usize = 200;

/// Balance response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable units.
    pub units: i64,
    /// Units on the mirror read path.
    pub mirror_units: Option<i64>,
}

/// Balance query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceQuery {
    /// User to read.
    pub user_id: UserId,
}

/// Read a user's balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, ApiError> {
    balance_of(&state, &query.user_id).await.map(Json)
}

/// Read the caller's own balance.
pub async fn get_my_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    balance_of(&state, &auth.user_id).await.map(Json)
}

/// Primary and mirror balance of `user_id`.
pub(crate) async fn balance_of(
    state: &AppState,
    user_id: &UserId,
) -> Result<BalanceResponse, ApiError> {
    let balance = state
        .store
        .get_balance(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Balance not found".into()))?;
    let mirror = state.store.get_mirror_balance(user_id).await?;

    Ok(BalanceResponse {
        user_id: user_id.to_string(),
        units: balance.spendable_units,
        mirror_units: mirror.map(|m| m.spendable_units),
    })
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTransactionsQuery {
    /// User to list. Ignored on `/me` routes.
    pub user_id: Option<UserId>,
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Signed change in units.
    pub amount_delta: i64,
    /// `deduction`, `credit`, `refund` or `adjustment`.
    pub kind: String,
    /// Reason or service code.
    pub reason: String,
    /// Job the mutation belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_job_id: Option<String>,
    /// Balance after the mutation.
    pub balance_after: i64,
    /// Timestamp.
    pub created_at: String,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount_delta: tx.amount_delta,
            kind: tx.kind.as_str().to_string(),
            reason: tx.reason.clone(),
            linked_job_id: tx.linked_job_id.map(|id| id.to_string()),
            balance_after: tx.balance_after,
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List a user's transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let user_id = query
        .user_id
        .ok_or_else(|| ApiError::BadRequest("userId is required".into()))?;
    transactions_of(&state, &user_id, &query).await.map(Json)
}

/// List the caller's own transaction history.
pub async fn list_my_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    transactions_of(&state, &auth.user_id, &query).await.map(Json)
}

async fn transactions_of(
    state: &AppState,
    user_id: &UserId,
    query: &ListTransactionsQuery,
) -> Result<ListTransactionsResponse, ApiError> {
    state
        .store
        .get_balance(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Balance not found".into()))?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.min(MAX_PAGE_SIZE);
    let transactions = state
        .store
        .list_transactions(user_id, limit + 1, query.offset)
        .await?;

    let has_more = transactions.len() > limit;
    let transactions = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(ListTransactionsResponse {
        transactions,
        has_more,
    })
}
