//! Settlement of terminal jobs.
//!
//! A job is settled once: success confirms the up-front deduction, failure
//! and timeout refund it. Both the refund and the `settled_at` marker are
//! conditional writes, so settling a job twice (poll and callback racing,
//! or the sweep catching up after a crash) is harmless.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use dua_ledger_core::GenerationJob;
use dua_ledger_store::{Result, Store};

/// What [`SettlementHandler::settle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// The job is still running.
    NotTerminal,
    /// Someone else already settled it.
    AlreadySettled,
    /// Success: the deduction stands.
    Confirmed,
    /// Failure or timeout: the reserved units were returned.
    Refunded {
        /// Units returned.
        units: i64,
        /// Balance after the refund.
        balance_after: i64,
    },
    /// Failure or timeout, but a refund for the job already existed.
    RefundAlreadyIssued,
}

/// Finalizes the credit impact of terminal jobs.
#[derive(Clone)]
pub struct SettlementHandler {
    store: Arc<dyn Store>,
}

impl SettlementHandler {
    /// Create a handler over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Settle a terminal job. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Returns a store error if the refund or the settled marker could not
    /// be written. The job stays unsettled and the sweep retries it.
    pub async fn settle(&self, job: &GenerationJob) -> Result<SettlementOutcome> {
        if !job.is_terminal() {
            return Ok(SettlementOutcome::NotTerminal);
        }
        if job.is_settled() {
            tracing::debug!(job_id = %job.id, "Job already settled");
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let outcome = if job.state.requires_refund() && job.cost_reserved > 0 {
            match self.store.refund_once(job).await? {
                Some(tx) => {
                    tracing::info!(
                        job_id = %job.id,
                        user_id = %job.user_id,
                        units = %job.cost_reserved,
                        balance = %tx.balance_after,
                        state = %job.state,
                        "Refunded reserved credits"
                    );
                    SettlementOutcome::Refunded {
                        units: job.cost_reserved,
                        balance_after: tx.balance_after,
                    }
                }
                None => {
                    tracing::debug!(job_id = %job.id, "Refund already issued");
                    SettlementOutcome::RefundAlreadyIssued
                }
            }
        } else {
            SettlementOutcome::Confirmed
        };

        if self.store.mark_settled(&job.id, Utc::now()).await? {
            tracing::info!(job_id = %job.id, state = %job.state, "Job settled");
            Ok(outcome)
        } else if outcome == SettlementOutcome::Confirmed {
            Ok(SettlementOutcome::AlreadySettled)
        } else {
            Ok(outcome)
        }
    }
}
