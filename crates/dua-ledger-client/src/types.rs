//! Request and response types for the ledger client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dua_ledger_core::{JobState, ProviderKind, TransactionKind};

/// Primary and mirror balance of a user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// User ID.
    pub user_id: String,
    /// Spendable units.
    pub units: i64,
    /// Units on the mirror read path, if the row exists.
    pub mirror_units: Option<i64>,
}

/// Create account request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    /// The new user.
    pub user_id: String,
    /// Opening balance.
    pub initial_units: i64,
}

/// A ledger entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction ID.
    pub id: String,
    /// Signed change in units.
    pub amount_delta: i64,
    /// Kind of mutation.
    pub kind: TransactionKind,
    /// Human-readable reason.
    pub reason: String,
    /// Job this entry belongs to.
    #[serde(default)]
    pub linked_job_id: Option<String>,
    /// Balance after the entry.
    pub balance_after: i64,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// One page of transaction history.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    /// Entries, newest first.
    pub transactions: Vec<Transaction>,
    /// Whether older entries exist.
    pub has_more: bool,
}

/// Submit job request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Paying user.
    pub user_id: String,
    /// Catalog service code, e.g. `music_generate_v5`.
    pub service_type: String,
    /// Provider-specific parameters.
    pub params: serde_json::Value,
}

/// Full job record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Internal job ID.
    pub job_id: String,
    /// Provider task ID, once dispatched.
    #[serde(default)]
    pub provider_job_id: Option<String>,
    /// Owner.
    pub user_id: String,
    /// Catalog service code.
    pub service_type: String,
    /// Provider fulfilling the job.
    pub provider: ProviderKind,
    /// Units reserved at submission.
    pub cost_reserved: i64,
    /// Lifecycle state.
    pub state: JobState,
    /// Result artifacts.
    #[serde(default)]
    pub result_payload: Option<serde_json::Value>,
    /// Failure reason.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Status polls made by the service.
    pub poll_attempts: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When settlement completed.
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

/// Job state snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Internal job ID.
    pub job_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Result artifacts.
    #[serde(default)]
    pub result_payload: Option<serde_json::Value>,
    /// Failure reason.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// A priced service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Service code.
    pub service_type: String,
    /// Display name.
    pub name: String,
    /// Provider.
    pub provider: ProviderKind,
    /// Provider model.
    pub model: String,
    /// Clip duration for video services.
    #[serde(default)]
    pub duration_secs: Option<u32>,
    /// Units charged.
    pub cost: i64,
    /// Whether the provider is configured.
    pub available: bool,
}

/// Redeem invite request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemInviteRequest {
    /// Code as typed.
    pub code: String,
    /// Redeeming user.
    pub user_id: String,
}

/// Redeemed invite.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    /// Normalised code.
    pub code: String,
    /// Redeeming user.
    pub user_id: String,
    /// Units granted.
    pub credited_units: i64,
    /// Balance after the grant.
    pub balance: i64,
}

/// Affordability of an operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheck {
    /// User ID.
    pub user_id: String,
    /// Operation or service code.
    pub operation: String,
    /// Units the operation costs.
    pub required: i64,
    /// Current balance, zero for unknown users.
    pub balance: i64,
    /// Units missing.
    pub deficit: i64,
    /// Whether the balance covers the cost.
    pub has_credits: bool,
    /// Whether the operation is free.
    pub is_free: bool,
}

/// Deduct request for an in-request operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductRequest {
    /// User to charge.
    pub user_id: String,
    /// Operation code.
    pub operation: String,
}

/// Result of a deduction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deduction {
    /// Ledger row, absent for free operations.
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Operation code.
    pub operation: String,
    /// Units removed.
    pub cost: i64,
    /// Balance afterwards.
    pub balance: i64,
}

/// Spending summary of a user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditStats {
    /// User ID.
    pub user_id: String,
    /// Units spent.
    pub total_spent: i64,
    /// Units refunded.
    pub total_refunded: i64,
    /// Ledger rows of any kind.
    pub transaction_count: u64,
    /// Newest ledger row.
    #[serde(default)]
    pub last_transaction: Option<Transaction>,
}

/// API error response format.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorDetail,
}

/// API error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
