//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use dua_ledger_core::LedgerError;
use dua_ledger_store::StoreError;

use crate::jobs::JobError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Balance does not cover the service cost.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Invite code already redeemed.
    #[error("invite code already used: {0}")]
    InviteAlreadyUsed(String),

    /// The provider refused the job; credits were refunded.
    #[error("{message}")]
    ProviderRejected {
        /// The failed job.
        job_id: String,
        /// Provider message.
        message: String,
    },

    /// The provider could not be reached; credits were refunded.
    #[error("{message}")]
    ProviderUnavailable {
        /// The timed out job.
        job_id: String,
        /// Last transport error.
        message: String,
    },

    /// A required integration is not configured.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientFunds { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_funds",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::InviteAlreadyUsed(code) => (
                StatusCode::CONFLICT,
                "invite_already_used",
                format!("Invite code {code} was already used"),
                None,
            ),
            Self::ProviderRejected { job_id, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "provider_rejected",
                message.clone(),
                Some(serde_json::json!({ "jobId": job_id, "refunded": true })),
            ),
            Self::ProviderUnavailable { job_id, message } => (
                StatusCode::BAD_GATEWAY,
                "provider_unavailable",
                message.clone(),
                Some(serde_json::json!({ "jobId": job_id, "refunded": true })),
            ),
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} not found: {id}")),
            StoreError::InsufficientFunds { balance, required } => {
                Self::InsufficientFunds { balance, required }
            }
            StoreError::InviteAlreadyUsed { code } => Self::InviteAlreadyUsed(code),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::InvalidAmount(msg) => Self::BadRequest(msg),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Ledger(e) => e.into(),
            JobError::Store(e) => e.into(),
            JobError::ProviderNotConfigured(provider) => {
                Self::ServiceUnavailable(format!("{provider} is not configured"))
            }
            JobError::Rejected { job_id, message } => Self::ProviderRejected {
                job_id: job_id.to_string(),
                message,
            },
            JobError::Unavailable { job_id, message } => Self::ProviderUnavailable {
                job_id: job_id.to_string(),
                message,
            },
        }
    }
}
