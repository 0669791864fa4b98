//! Balance synchronizer.
//!
//! The primary balance table and the mirror table are kept equal by the
//! store itself: every write to one side calls [`plan_propagation`] for the
//! other side inside the same unit of work. Propagation is skipped when the
//! target already holds the source value, which is what stops a write on
//! one side from bouncing back and forth between the two tables.

use serde::{Deserialize, Serialize};

/// Which side of the pair was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    /// The primary balance owned by the ledger.
    Primary,
    /// The mirror table, written directly by an admin tool.
    Mirror,
}

impl SyncSource {
    /// The side that must follow this one.
    #[must_use]
    pub const fn target(self) -> Self {
        match self {
            Self::Primary => Self::Mirror,
            Self::Mirror => Self::Primary,
        }
    }
}

/// Decide whether a write on `source` must be copied to the other side.
///
/// Returns the units to write on the target, or `None` when the target
/// already matches and propagation stops.
#[must_use]
pub fn plan_propagation(source: SyncSource, source_units: i64, target_units: Option<i64>) -> Option<i64> {
    match target_units {
        Some(current) if current == source_units => {
            tracing::trace!(
                source = ?source,
                units = source_units,
                "Propagation short-circuited, target already in sync"
            );
            None
        }
        _ => Some(source_units),
    }
}

/// Result of checking the mirror against the primary balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Both sides agree.
    InSync {
        /// Current balance.
        units: i64,
    },
    /// The mirror had drifted and was rewritten from the primary.
    Repaired {
        /// Primary balance, now also in the mirror.
        units: i64,
        /// What the mirror held before repair. `None` if the row was missing.
        mirror_was: Option<i64>,
    },
}

impl SyncOutcome {
    /// Whether a repair was needed.
    #[must_use]
    pub const fn was_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }
}
