//! Error types for ledger domain validation.

use crate::ids::IdError;

/// Result type for ledger domain operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors raised while validating ledger domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Amount is zero, negative, or otherwise unusable.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The service code is not in the pricing catalog.
    #[error("unknown service type: {0}")]
    UnknownService(String),

    /// Invite code failed format validation.
    #[error("invalid invite code: {0}")]
    InvalidInviteCode(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Generation parameters rejected before reaching a provider.
    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),
}
