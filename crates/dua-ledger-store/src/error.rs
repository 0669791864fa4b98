//! Error types for ledger storage.

use dua_ledger_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record (`balance`, `job`, `invite`).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Balance does not cover the requested deduction.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Current balance in units.
        balance: i64,
        /// Units requested.
        required: i64,
    },

    /// Invite code was already redeemed.
    #[error("invite code already used: {code}")]
    InviteAlreadyUsed {
        /// The code.
        code: String,
    },

    /// Record already exists or conflicts with stored state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Amount is not strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<LedgerError> for StoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            other => Self::Conflict(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
