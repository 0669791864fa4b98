//! Generation job orchestration.
//!
//! - [`JobSubmitter`]: prices, reserves and dispatches new jobs.
//! - [`JobTracker`]: polls provider jobs and applies callbacks.
//! - [`SettlementHandler`]: confirms or refunds terminal jobs.
//! - [`sweep`]: periodic reconciliation of stale and unsettled jobs.

pub mod settlement;
pub mod submitter;
pub mod sweep;
pub mod tracker;

pub use settlement::{SettlementHandler, SettlementOutcome};
pub use submitter::{JobSubmitter, SubmitJob};
pub use sweep::{spawn_periodic, sweep, SweepReport};
pub use tracker::JobTracker;

use dua_ledger_core::{JobId, LedgerError, ProviderKind};
use dua_ledger_store::StoreError;

/// Errors from job submission.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Unknown service code or invalid parameters.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Storage failure, including insufficient funds.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The service maps to a provider without credentials.
    #[error("provider not configured: {0}")]
    ProviderNotConfigured(ProviderKind),

    /// The provider refused the job. Reserved units were refunded.
    #[error("provider rejected job {job_id}: {message}")]
    Rejected {
        /// The failed job.
        job_id: JobId,
        /// Provider message.
        message: String,
    },

    /// The provider could not be reached. Reserved units were refunded.
    #[error("provider unavailable for job {job_id}: {message}")]
    Unavailable {
        /// The timed out job.
        job_id: JobId,
        /// Last transport error.
        message: String,
    },
}

#[cfg(test)]
pub(crate) mod testing {
    //! A provider double driven by a script of responses.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use dua_ledger_core::{
        GenerationJob, JobId, JobState, LedgerError, Observation, ProviderJobId, ProviderKind,
        ServiceSpec, UserId,
    };
    use dua_ledger_store::{MemoryStore, Store};

    use crate::providers::{ProviderAdapter, ProviderError, SubmitRequest};

    type Scripted<T> = Mutex<VecDeque<Result<T, ProviderError>>>;

    pub struct ScriptedAdapter {
        submits: Scripted<ProviderJobId>,
        statuses: Scripted<Observation>,
        exhausted: Result<Observation, ProviderError>,
        submit_calls: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        /// Answers status polls from `statuses`, then reports `SUBMITTED`.
        pub fn new(statuses: Vec<Result<Observation, ProviderError>>) -> Self {
            Self {
                submits: Mutex::new(VecDeque::new()),
                statuses: Mutex::new(statuses.into()),
                exhausted: Ok(Observation::state(JobState::Submitted)),
                submit_calls: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
            }
        }

        /// Every status poll fails with `err`.
        pub fn failing(err: ProviderError) -> Self {
            Self {
                exhausted: Err(err),
                ..Self::new(vec![])
            }
        }

        /// Answer submissions from `submits` before accepting them.
        pub fn with_submits(self, submits: Vec<Result<ProviderJobId, ProviderError>>) -> Self {
            *self.submits.lock().unwrap() = submits.into();
            self
        }

        pub fn calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }

        pub fn submit_calls(&self) -> usize {
            self.submit_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Suno
        }

        fn default_poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn supports_callbacks(&self) -> bool {
            true
        }

        fn validate(&self, _spec: &ServiceSpec, params: &Value) -> Result<(), LedgerError> {
            if params.get("prompt").is_some() {
                Ok(())
            } else {
                Err(LedgerError::InvalidParams("prompt is required".into()))
            }
        }

        async fn submit(&self, request: &SubmitRequest<'_>) -> Result<ProviderJobId, ProviderError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submits.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(ProviderJobId::new(format!("task-{}", request.job_id)).unwrap())
            })
        }

        async fn status(&self, _id: &ProviderJobId) -> Result<Observation, ProviderError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.exhausted.clone())
        }

        fn parse_callback(&self, _body: &Value) -> Result<(ProviderJobId, Observation), ProviderError> {
            Err(ProviderError::Unsupported {
                provider: ProviderKind::Suno,
                operation: "callbacks",
            })
        }
    }

    /// A user holding `units` with one reserved, dispatched job costing `cost`.
    pub async fn reserve_dispatched(store: &MemoryStore, units: i64, cost: i64) -> GenerationJob {
        let user_id = UserId::generate();
        store.create_balance(&user_id, units).await.unwrap();
        let job = GenerationJob::new(
            JobId::generate(),
            user_id,
            "music_generate_v5",
            ProviderKind::Suno,
            cost,
            serde_json::json!({"prompt": "lofi"}),
        );
        store.reserve_job(&job).await.unwrap();
        let provider_job_id = ProviderJobId::new(format!("task-{}", job.id)).unwrap();
        store
            .attach_provider_job_id(&job.id, &provider_job_id)
            .await
            .unwrap()
    }
}
