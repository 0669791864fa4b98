//! Reconciliation sweep.
//!
//! Catches whatever the tracker missed: jobs that outlived the job timeout
//! (including ones whose dispatch never recorded a provider task), active
//! jobs without a poll task after a restart, and terminal jobs whose
//! settlement was interrupted.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use dua_ledger_core::Observation;
use dua_ledger_store::Result;

use crate::jobs::{JobTracker, SettlementOutcome};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Stale jobs moved to `TIMED_OUT`.
    pub timed_out: usize,
    /// Active jobs handed back to the tracker.
    pub resumed: usize,
    /// Terminal jobs whose settlement completed here.
    pub settled: usize,
    /// Jobs skipped because of a store error.
    pub errors: usize,
}

impl SweepReport {
    /// Whether the sweep changed nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.timed_out == 0 && self.resumed == 0 && self.settled == 0 && self.errors == 0
    }
}

/// Run one reconciliation pass.
///
/// Per-job failures are logged and counted, not returned.
///
/// # Errors
///
/// Returns an error only if the job lists could not be read.
pub async fn sweep(tracker: &JobTracker) -> Result<SweepReport> {
    let store = tracker.store();
    let job_timeout = tracker.config().job_timeout;
    let now = Utc::now();
    let mut report = SweepReport::default();

    for job in store.list_active_jobs().await? {
        let age = (now - job.created_at).to_std().unwrap_or_default();
        if age < job_timeout {
            if tracker.track(&job) {
                report.resumed += 1;
            }
            continue;
        }

        let reason = format!("job exceeded {}s without a terminal status", job_timeout.as_secs());
        match tracker.observe(&job.id, Observation::timed_out(reason)).await {
            Ok(outcome) if outcome.transition.is_final() => report.timed_out += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to time out stale job");
                report.errors += 1;
            }
        }
    }

    for job in store.list_unsettled_jobs().await? {
        match tracker.settlement().settle(&job).await {
            Ok(SettlementOutcome::NotTerminal | SettlementOutcome::AlreadySettled) => {}
            Ok(_) => report.settled += 1,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to settle job");
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

/// Run [`sweep`] now and then every `every` until the tracker shuts down.
pub fn spawn_periodic(tracker: JobTracker, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = tracker.shutdown_signal();
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match sweep(&tracker).await {
                Ok(report) if report.is_noop() => tracing::debug!("Sweep found nothing to do"),
                Ok(report) => tracing::info!(
                    timed_out = report.timed_out,
                    resumed = report.resumed,
                    settled = report.settled,
                    errors = report.errors,
                    "Sweep completed"
                ),
                Err(e) => tracing::error!(error = %e, "Sweep failed"),
            }
        }
    })
}
