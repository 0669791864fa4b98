//! Balance records.
//!
//! Two representations of the same quantity exist: the primary
//! [`UserBalance`] owned by the balance store, and a denormalized
//! [`MirrorBalance`] serving the legacy admin read path. The store keeps
//! them equal through its synchronizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LedgerError, UserId};

/// Units granted when a user redeems an invite code.
pub const DEFAULT_INVITE_WELCOME_UNITS: i64 = 150;

/// The authoritative spendable balance of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    /// The user.
    pub user_id: UserId,

    /// Spendable units. Never negative.
    pub spendable_units: i64,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// Create a balance row holding `units`.
    #[must_use]
    pub fn new(user_id: UserId, units: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            spendable_units: units,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the balance covers `amount` units.
    #[must_use]
    pub fn covers(&self, amount: i64) -> bool {
        self.spendable_units >= amount
    }

    /// The balance after applying a signed `delta`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if the result overflows `i64`
    /// or would be negative.
    pub fn after_delta(&self, delta: i64) -> Result<i64, LedgerError> {
        match self.spendable_units.checked_add(delta) {
            Some(units) if units >= 0 => Ok(units),
            Some(units) => Err(LedgerError::InvalidAmount(format!(
                "balance of {} cannot go to {units}",
                self.spendable_units
            ))),
            None => Err(LedgerError::InvalidAmount(format!(
                "adding {delta} to balance of {} overflows",
                self.spendable_units
            ))),
        }
    }
}

/// Denormalized copy of a user's balance for the alternate read path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorBalance {
    /// The user.
    pub user_id: UserId,

    /// Mirrored spendable units.
    pub spendable_units: i64,

    /// When the mirror last changed.
    pub updated_at: DateTime<Utc>,
}

impl MirrorBalance {
    /// Mirror of a primary balance.
    #[must_use]
    pub fn of(primary: &UserBalance) -> Self {
        Self {
            user_id: primary.user_id,
            spendable_units: primary.spendable_units,
            updated_at: primary.updated_at,
        }
    }
}
