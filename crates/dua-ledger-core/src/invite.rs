//! Single-use invite codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LedgerError, UserId};

/// Shortest accepted invite code.
pub const MIN_INVITE_CODE_LEN: usize = 6;

/// An invite code and its redemption state.
///
/// A code moves from `active = true` to `active = false` exactly once, and
/// only through the store's conditional redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCode {
    /// Normalised code (upper-case).
    pub code: String,

    /// Whether the code can still be redeemed.
    pub active: bool,

    /// Who redeemed it.
    pub used_by: Option<UserId>,

    /// When it was redeemed.
    pub used_at: Option<DateTime<Utc>>,

    /// When it was issued.
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    /// Issue a fresh, active code.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInviteCode` if the code fails
    /// [`normalize`](Self::normalize).
    pub fn issue(code: &str) -> Result<Self, LedgerError> {
        Ok(Self {
            code: Self::normalize(code)?,
            active: true,
            used_by: None,
            used_at: None,
            created_at: Utc::now(),
        })
    }

    /// Trim and upper-case a code as typed by a user.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInviteCode` when the code is shorter than
    /// [`MIN_INVITE_CODE_LEN`] or contains anything but ASCII letters,
    /// digits and dashes.
    pub fn normalize(code: &str) -> Result<String, LedgerError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() < MIN_INVITE_CODE_LEN {
            return Err(LedgerError::InvalidInviteCode(format!(
                "code must have at least {MIN_INVITE_CODE_LEN} characters"
            )));
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(LedgerError::InvalidInviteCode(
                "code may only contain letters, digits and dashes".to_string(),
            ));
        }
        Ok(code)
    }
}
