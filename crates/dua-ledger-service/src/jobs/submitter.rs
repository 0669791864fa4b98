//! Job submission: price, reserve, dispatch, track.
//!
//! Credits are reserved before the provider is called, with the job row
//! written in the same unit of work. A dispatch that fails after the
//! reservation finalizes the job through the tracker, so the refund goes
//! through the same settlement path as any other failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use dua_ledger_core::{GenerationJob, JobId, Observation, ProviderJobId, UserId};

use crate::config::ServiceConfig;
use crate::jobs::{JobError, JobTracker};
use crate::providers::{ProviderAdapter, ProviderError, ProviderRegistry, SubmitRequest};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of dispatch attempts on transient provider errors.
const DISPATCH_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between dispatch attempts (doubles with each attempt).
const DISPATCH_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff between dispatch attempts.
const DISPATCH_MAX_BACKOFF_MS: u64 = 5000;

/// A request to start one generation.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    /// Paying user.
    pub user_id: UserId,
    /// Catalog service code.
    pub service_code: String,
    /// Provider-specific generation parameters.
    pub params: Value,
}

/// Starts generation jobs.
#[derive(Clone)]
pub struct JobSubmitter {
    tracker: JobTracker,
    providers: ProviderRegistry,
    config: Arc<ServiceConfig>,
}

impl JobSubmitter {
    /// Create a submitter. Dispatched jobs are handed to `tracker`.
    #[must_use]
    pub fn new(tracker: JobTracker, providers: ProviderRegistry, config: Arc<ServiceConfig>) -> Self {
        Self {
            tracker,
            providers,
            config,
        }
    }

    /// Submit a job.
    ///
    /// On success the job is `SUBMITTED` with a provider task ID and is
    /// being tracked. Validation problems and insufficient funds fail
    /// before anything is written.
    ///
    /// # Errors
    ///
    /// - `JobError::Ledger` for unknown services or invalid parameters.
    /// - `JobError::ProviderNotConfigured` if the provider has no adapter.
    /// - `JobError::Store` with `StoreError::InsufficientFunds` when the
    ///   balance doesn't cover the cost.
    /// - `JobError::Rejected` / `JobError::Unavailable` when dispatch
    ///   failed. The job is terminal and its units were refunded.
    pub async fn submit(&self, request: SubmitJob) -> Result<GenerationJob, JobError> {
        let spec = self.config.pricing.resolve(&request.service_code)?;
        let adapter = self
            .providers
            .get(spec.provider)
            .ok_or(JobError::ProviderNotConfigured(spec.provider))?;
        adapter.validate(spec, &request.params)?;

        let job = GenerationJob::new(
            JobId::generate(),
            request.user_id,
            &spec.code,
            spec.provider,
            spec.cost,
            request.params,
        );

        let store = self.tracker.store();
        if spec.is_free() {
            store.insert_job(&job).await?;
        } else {
            let tx = store.reserve_job(&job).await?;
            tracing::info!(
                job_id = %job.id,
                user_id = %job.user_id,
                service = %spec.code,
                units = spec.cost,
                balance = tx.balance_after,
                "Reserved credits for job"
            );
        }

        let callback_url = if adapter.supports_callbacks() {
            self.config.callback_url(spec.provider)
        } else {
            None
        };
        let submit = SubmitRequest {
            job_id: job.id,
            spec,
            params: &job.params,
            callback_url,
        };

        match dispatch_with_retry(adapter.as_ref(), &submit).await {
            Ok(provider_job_id) => {
                let job = store
                    .attach_provider_job_id(&job.id, &provider_job_id)
                    .await
                    .inspect_err(|e| {
                        tracing::error!(
                            job_id = %job.id,
                            provider_job_id = %provider_job_id,
                            error = %e,
                            "Dispatched job but could not record provider task"
                        );
                    })?;
                tracing::info!(
                    job_id = %job.id,
                    provider = %job.provider,
                    provider_job_id = %provider_job_id,
                    "Job dispatched"
                );
                self.tracker.track(&job);
                Ok(job)
            }
            Err(e) if e.is_transient() => {
                let message = e.to_string();
                self.tracker
                    .observe(&job.id, Observation::timed_out(format!("dispatch failed: {message}")))
                    .await?;
                Err(JobError::Unavailable {
                    job_id: job.id,
                    message,
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(job_id = %job.id, error = %message, "Provider rejected job");
                self.tracker
                    .observe(&job.id, Observation::failed(message.clone()))
                    .await?;
                Err(JobError::Rejected {
                    job_id: job.id,
                    message,
                })
            }
        }
    }
}

/// Dispatch with exponential backoff on transient errors.
async fn dispatch_with_retry(
    adapter: &dyn ProviderAdapter,
    request: &SubmitRequest<'_>,
) -> Result<ProviderJobId, ProviderError> {
    let mut attempt = 0;
    let mut backoff_ms = DISPATCH_INITIAL_BACKOFF_MS;

    loop {
        match adapter.submit(request).await {
            Ok(provider_job_id) => return Ok(provider_job_id),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;

                if attempt >= DISPATCH_MAX_ATTEMPTS {
                    tracing::warn!(
                        job_id = %request.job_id,
                        attempt = %attempt,
                        error = %e,
                        "Dispatch failed after max retries"
                    );
                    return Err(e);
                }

                tracing::debug!(
                    job_id = %request.job_id,
                    attempt = %attempt,
                    backoff_ms = %backoff_ms,
                    error = %e,
                    "Dispatch failed, retrying"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(DISPATCH_MAX_BACKOFF_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackingConfig;
    use crate::jobs::testing::ScriptedAdapter;
    use crate::jobs::SettlementHandler;
    use dua_ledger_core::{JobState, LedgerError, TransactionKind};
    use dua_ledger_store::{MemoryStore, Store, StoreError};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        adapter: Arc<ScriptedAdapter>,
        tracker: JobTracker,
        submitter: JobSubmitter,
    }

    fn fixture(adapter: ScriptedAdapter) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(adapter);
        let providers = ProviderRegistry::new().with(adapter.clone());
        let dyn_store: Arc<dyn Store> = store.clone();
        let config = ServiceConfig {
            tracking: TrackingConfig {
                poll_interval: Some(Duration::from_secs(30)),
                ..TrackingConfig::default()
            },
            ..ServiceConfig::default()
        };
        let tracker = JobTracker::new(
            dyn_store.clone(),
            providers.clone(),
            SettlementHandler::new(dyn_store),
            config.tracking.clone(),
        );
        let submitter = JobSubmitter::new(tracker.clone(), providers, Arc::new(config));
        Fixture {
            store,
            adapter,
            tracker,
            submitter,
        }
    }

    async fn funded_user(store: &MemoryStore, units: i64) -> UserId {
        let user_id = UserId::generate();
        store.create_balance(&user_id, units).await.unwrap();
        user_id
    }

    fn music(user_id: UserId) -> SubmitJob {
        SubmitJob {
            user_id,
            service_code: "music_generate_v5".into(),
            params: json!({"prompt": "lofi beats"}),
        }
    }

    async fn balance(store: &MemoryStore, user_id: &UserId) -> i64 {
        store.get_balance(user_id).await.unwrap().unwrap().spendable_units
    }

    #[tokio::test]
    async fn submit_reserves_dispatches_and_tracks() {
        let f = fixture(ScriptedAdapter::new(vec![]));
        let user_id = funded_user(&f.store, 100).await;

        let job = f.submitter.submit(music(user_id)).await.unwrap();

        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.cost_reserved, 6);
        assert!(job.provider_job_id.is_some());
        assert!(f.tracker.is_tracking(&job.id));
        assert_eq!(balance(&f.store, &user_id).await, 94);

        let txs = f.store.transactions_for_job(&job.id).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Deduction);
        assert_eq!(txs[0].amount_delta, -6);
        f.tracker.shutdown();
    }

    #[tokio::test]
    async fn insufficient_funds_writes_nothing() {
        let f = fixture(ScriptedAdapter::new(vec![]));
        let user_id = funded_user(&f.store, 3).await;

        let err = f.submitter.submit(music(user_id)).await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Store(StoreError::InsufficientFunds {
                balance: 3,
                required: 6
            })
        ));
        assert_eq!(f.adapter.submit_calls(), 0);
        assert!(f.store.list_active_jobs().await.unwrap().is_empty());
        assert_eq!(balance(&f.store, &user_id).await, 3);
    }

    #[tokio::test]
    async fn invalid_requests_fail_before_reserving() {
        let f = fixture(ScriptedAdapter::new(vec![]));
        let user_id = funded_user(&f.store, 100).await;

        let unknown = SubmitJob {
            service_code: "hologram".into(),
            ..music(user_id)
        };
        assert!(matches!(
            f.submitter.submit(unknown).await,
            Err(JobError::Ledger(LedgerError::UnknownService(_)))
        ));

        let no_prompt = SubmitJob {
            params: json!({}),
            ..music(user_id)
        };
        assert!(matches!(
            f.submitter.submit(no_prompt).await,
            Err(JobError::Ledger(LedgerError::InvalidParams(_)))
        ));

        let video = SubmitJob {
            service_code: "video_gen4_5s".into(),
            ..music(user_id)
        };
        assert!(matches!(
            f.submitter.submit(video).await,
            Err(JobError::ProviderNotConfigured(_))
        ));

        assert_eq!(balance(&f.store, &user_id).await, 100);
        assert_eq!(f.adapter.submit_calls(), 0);
    }

    #[tokio::test]
    async fn rejection_fails_job_and_refunds() {
        let f = fixture(ScriptedAdapter::new(vec![]).with_submits(vec![Err(
            ProviderError::Rejected {
                code: 400,
                message: "prompt flagged".into(),
            },
        )]));
        let user_id = funded_user(&f.store, 50).await;

        let err = f.submitter.submit(music(user_id)).await.unwrap_err();
        let JobError::Rejected { job_id, .. } = err else {
            panic!("expected rejection, got {err:?}");
        };

        assert_eq!(f.adapter.submit_calls(), 1);
        let job = f.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.is_settled());
        assert_eq!(balance(&f.store, &user_id).await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_dispatch_errors_are_retried_then_time_out() {
        let down = || Err(ProviderError::Transient("503".into()));
        let f = fixture(ScriptedAdapter::new(vec![]).with_submits(vec![down(), down(), down()]));
        let user_id = funded_user(&f.store, 50).await;

        let err = f.submitter.submit(music(user_id)).await.unwrap_err();
        let JobError::Unavailable { job_id, .. } = err else {
            panic!("expected unavailable, got {err:?}");
        };

        assert_eq!(f.adapter.submit_calls(), 3);
        let job = f.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::TimedOut);
        assert_eq!(balance(&f.store, &user_id).await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_dispatch_error_recovers() {
        let f = fixture(
            ScriptedAdapter::new(vec![])
                .with_submits(vec![Err(ProviderError::Transient("reset".into()))]),
        );
        let user_id = funded_user(&f.store, 50).await;

        let job = f.submitter.submit(music(user_id)).await.unwrap();

        assert_eq!(f.adapter.submit_calls(), 2);
        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(balance(&f.store, &user_id).await, 44);
        f.tracker.shutdown();
    }
}
