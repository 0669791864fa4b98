//! Ledger transactions.
//!
//! Every balance mutation appends exactly one immutable [`Transaction`].
//! Refund rows carry the job they compensate, which is what makes
//! settlement idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, LedgerError, TransactionId, UserId};

/// An immutable record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance changed.
    pub user_id: UserId,

    /// Signed change in units. Negative for deductions.
    pub amount_delta: i64,

    /// What kind of mutation this was.
    pub kind: TransactionKind,

    /// Free-text reason or service code.
    pub reason: String,

    /// Generation job this mutation belongs to, if any.
    pub linked_job_id: Option<JobId>,

    /// Balance after the mutation was applied.
    pub balance_after: i64,

    /// Opaque key-value metadata.
    pub metadata: serde_json::Value,

    /// When the mutation happened.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    fn build(
        user_id: UserId,
        amount_delta: i64,
        kind: TransactionKind,
        reason: impl Into<String>,
        linked_job_id: Option<JobId>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount_delta,
            kind,
            reason: reason.into(),
            linked_job_id,
            balance_after: 0,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// A deduction of `amount` units. The delta is stored negative.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` unless `amount > 0`.
    pub fn deduction(
        user_id: UserId,
        amount: i64,
        reason: impl Into<String>,
        linked_job_id: Option<JobId>,
    ) -> Result<Self, LedgerError> {
        let amount = positive(amount)?;
        Ok(Self::build(
            user_id,
            -amount,
            TransactionKind::Deduction,
            reason,
            linked_job_id,
        ))
    }

    /// A credit (grant, invite welcome, manual top-up).
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` unless `amount > 0`.
    pub fn credit(
        user_id: UserId,
        amount: i64,
        reason: impl Into<String>,
        linked_job_id: Option<JobId>,
    ) -> Result<Self, LedgerError> {
        let amount = positive(amount)?;
        Ok(Self::build(
            user_id,
            amount,
            TransactionKind::Credit,
            reason,
            linked_job_id,
        ))
    }

    /// A compensating refund for a failed or timed out job.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` unless `amount > 0`.
    pub fn refund(user_id: UserId, amount: i64, job_id: JobId) -> Result<Self, LedgerError> {
        let amount = positive(amount)?;
        Ok(Self::build(
            user_id,
            amount,
            TransactionKind::Refund,
            "refund",
            Some(job_id),
        ))
    }

    /// An audited administrative adjustment. `delta` may have either sign;
    /// a zero delta is still recorded so every overwrite leaves a trace.
    #[must_use]
    pub fn adjustment(user_id: UserId, delta: i64, reason: impl Into<String>) -> Self {
        Self::build(user_id, delta, TransactionKind::Adjustment, reason, None)
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record the resulting balance. Stores set this inside the unit of
    /// work that applies the mutation.
    #[must_use]
    pub fn with_balance_after(mut self, balance_after: i64) -> Self {
        self.balance_after = balance_after;
        self
    }

    /// Absolute number of units moved.
    #[must_use]
    pub fn units(&self) -> i64 {
        self.amount_delta.abs()
    }
}

fn positive(amount: i64) -> Result<i64, LedgerError> {
    if amount > 0 {
        Ok(amount)
    } else {
        Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )))
    }
}

/// Kind of ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Units spent on a generation.
    Deduction,

    /// Units granted.
    Credit,

    /// Units returned for a failed or timed out job.
    Refund,

    /// Administrative overwrite, audited.
    Adjustment,
}

impl TransactionKind {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deduction => "deduction",
            Self::Credit => "credit",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }

    /// Parse the storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deduction" => Some(Self::Deduction),
            "credit" => Some(Self::Credit),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduction_is_negative() {
        let user_id = UserId::generate();
        let tx = Transaction::deduction(user_id, 6, "music_generate_v5", None).unwrap();
        assert_eq!(tx.amount_delta, -6);
        assert_eq!(tx.units(), 6);
        assert_eq!(tx.kind, TransactionKind::Deduction);
    }

    #[test]
    fn refund_links_job() {
        let job_id = JobId::generate();
        let tx = Transaction::refund(UserId::generate(), 6, job_id).unwrap();
        assert_eq!(tx.amount_delta, 6);
        assert_eq!(tx.linked_job_id, Some(job_id));
        assert_eq!(tx.kind, TransactionKind::Refund);
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let user_id = UserId::generate();
        assert!(Transaction::deduction(user_id, 0, "x", None).is_err());
        assert!(Transaction::credit(user_id, -5, "x", None).is_err());
        assert!(Transaction::refund(user_id, 0, JobId::generate()).is_err());
    }

    #[test]
    fn kind_storage_names_parse_back() {
        for kind in [
            TransactionKind::Deduction,
            TransactionKind::Credit,
            TransactionKind::Refund,
            TransactionKind::Adjustment,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("purchase"), None);
    }
}
