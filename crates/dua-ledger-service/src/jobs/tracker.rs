//! Server-owned tracking of provider jobs.
//!
//! Every active job with a provider task ID gets exactly one background
//! poll task. Polls and callbacks both funnel into [`JobTracker::observe`],
//! which applies the observation with the store's conditional update and
//! settles the job when it turns terminal. Whichever path gets there first
//! wins; the other sees an unchanged or ignored transition.
//!
//! Stopping the tracker only stops local polling. Provider jobs keep
//! running and are picked up again by [`JobTracker::resume`] or the
//! reconciliation sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use dua_ledger_core::{GenerationJob, JobId, Observation, ProviderJobId, Transition};
use dua_ledger_store::{ObservationOutcome, Result, Store};

use crate::config::TrackingConfig;
use crate::jobs::settlement::SettlementHandler;
use crate::providers::{ProviderAdapter, ProviderError, ProviderRegistry};

/// Handle to the job tracker. Cheap to clone.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    settlement: SettlementHandler,
    config: TrackingConfig,
    /// Jobs with a live poll task, and the handle used to wake it.
    polling: Mutex<HashMap<JobId, Arc<Notify>>>,
    shutdown: watch::Sender<bool>,
}

impl JobTracker {
    /// Create a tracker. No tasks run until [`track`](Self::track) or
    /// [`resume`](Self::resume) is called.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        settlement: SettlementHandler,
        config: TrackingConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                providers,
                settlement,
                config,
                polling: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// The settlement handler used for terminal jobs.
    #[must_use]
    pub fn settlement(&self) -> &SettlementHandler {
        &self.inner.settlement
    }

    /// Polling and timeout policy.
    #[must_use]
    pub fn config(&self) -> &TrackingConfig {
        &self.inner.config
    }

    /// Start polling `job` in the background.
    ///
    /// Returns `false` without spawning anything when the job is terminal,
    /// has no provider task ID yet, its provider isn't configured, the
    /// tracker is shutting down, or a poll task for it already exists.
    pub fn track(&self, job: &GenerationJob) -> bool {
        if job.is_terminal() || self.is_shutting_down() {
            return false;
        }
        let Some(provider_job_id) = job.provider_job_id.clone() else {
            tracing::debug!(job_id = %job.id, "Job has no provider task yet, not tracking");
            return false;
        };
        let Some(adapter) = self.inner.providers.get(job.provider) else {
            tracing::warn!(
                job_id = %job.id,
                provider = %job.provider,
                "Provider not configured, cannot track job"
            );
            return false;
        };

        let notify = Arc::new(Notify::new());
        {
            let mut polling = self.polling();
            if polling.contains_key(&job.id) {
                tracing::debug!(job_id = %job.id, "Job already tracked");
                return false;
            }
            polling.insert(job.id, Arc::clone(&notify));
        }

        let registration = Registration {
            tracker: self.clone(),
            job_id: job.id,
        };
        let created_at = job.created_at;
        let shutdown = self.shutdown_signal();
        tracing::debug!(job_id = %job.id, provider_job_id = %provider_job_id, "Tracking job");

        tokio::spawn(async move {
            let tracker = &registration.tracker;
            let job_id = registration.job_id;
            if let Err(e) = tracker
                .poll_until_terminal(job_id, created_at, &provider_job_id, adapter, notify, shutdown)
                .await
            {
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    "Job tracking stopped on store error; the sweep will resume it"
                );
            }
        });

        true
    }

    /// Apply an observation from either a poll or a callback.
    ///
    /// Settles the job when it is terminal and not yet settled, and wakes
    /// its poll task so it can exit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown jobs, or a store error if
    /// the update or the settlement failed.
    pub async fn observe(
        &self,
        job_id: &JobId,
        observation: Observation,
    ) -> Result<ObservationOutcome> {
        let outcome = self
            .inner
            .store
            .record_observation(job_id, &observation)
            .await?;

        match outcome.transition {
            Transition::Finalized { from, to } => {
                tracing::info!(job_id = %job_id, from = %from, to = %to, "Job reached terminal state");
            }
            Transition::Advanced { from, to } => {
                tracing::debug!(job_id = %job_id, from = %from, to = %to, "Job advanced");
            }
            Transition::Unchanged => {
                tracing::debug!(job_id = %job_id, state = %outcome.job.state, "Observation repeats current state");
            }
            Transition::Ignored { current, observed } if current.is_terminal() => {
                tracing::warn!(
                    job_id = %job_id,
                    current = %current,
                    observed = %observed,
                    "Ignoring transition on terminal job"
                );
            }
            Transition::Ignored { current, observed } => {
                tracing::debug!(
                    job_id = %job_id,
                    current = %current,
                    observed = %observed,
                    "Ignoring backward transition"
                );
            }
        }

        if outcome.job.is_terminal() {
            if !outcome.job.is_settled() {
                self.inner.settlement.settle(&outcome.job).await?;
            }
            self.wake(job_id);
        }

        Ok(outcome)
    }

    /// Re-track every non-terminal job, e.g. after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if active jobs could not be listed.
    pub async fn resume(&self) -> Result<usize> {
        let jobs = self.inner.store.list_active_jobs().await?;
        let resumed = jobs.iter().filter(|job| self.track(job)).count();
        tracing::info!(active = jobs.len(), resumed = resumed, "Resumed job tracking");
        Ok(resumed)
    }

    /// Stop all poll tasks. Provider jobs are not cancelled.
    pub fn shutdown(&self) {
        tracing::info!(tracked = self.tracked_count(), "Stopping job tracker");
        self.inner.shutdown.send_replace(true);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// A receiver that flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Whether a poll task is running for `job_id`.
    #[must_use]
    pub fn is_tracking(&self, job_id: &JobId) -> bool {
        self.polling().contains_key(job_id)
    }

    /// Number of running poll tasks.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.polling().len()
    }

    fn wake(&self, job_id: &JobId) {
        if let Some(notify) = self.polling().get(job_id) {
            notify.notify_one();
        }
    }

    fn polling(&self) -> MutexGuard<'_, HashMap<JobId, Arc<Notify>>> {
        self.inner
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_until_terminal(
        &self,
        job_id: JobId,
        created_at: DateTime<Utc>,
        provider_job_id: &ProviderJobId,
        adapter: Arc<dyn ProviderAdapter>,
        notify: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = &self.inner.config;
        let interval = config
            .poll_interval
            .unwrap_or_else(|| adapter.default_poll_interval());
        let elapsed = (Utc::now() - created_at).to_std().unwrap_or_default();
        let deadline = Instant::now() + config.job_timeout.saturating_sub(elapsed);
        let mut transient_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                tracing::debug!(job_id = %job_id, "Tracker stopping, provider job left running");
                return Ok(());
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = notify.notified() => {}
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                tracing::debug!(job_id = %job_id, "Tracker stopping, provider job left running");
                return Ok(());
            }

            let Some(job) = self.inner.store.get_job(&job_id).await? else {
                tracing::warn!(job_id = %job_id, "Tracked job disappeared");
                return Ok(());
            };
            if job.is_terminal() {
                if !job.is_settled() {
                    self.inner.settlement.settle(&job).await?;
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                let reason = format!(
                    "no terminal status within {}s",
                    config.job_timeout.as_secs()
                );
                self.observe(&job_id, Observation::timed_out(reason)).await?;
                return Ok(());
            }

            let attempts = self.inner.store.record_poll(&job_id).await?;
            if attempts > config.max_poll_attempts {
                let reason = format!("gave up after {} status polls", config.max_poll_attempts);
                self.observe(&job_id, Observation::timed_out(reason)).await?;
                return Ok(());
            }

            let polled = tokio::time::timeout(config.poll_call_timeout, adapter.status(provider_job_id))
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::Transient(format!(
                        "status call exceeded {}ms",
                        config.poll_call_timeout.as_millis()
                    )))
                });

            match polled {
                Ok(observation) => {
                    transient_failures = 0;
                    tracing::debug!(
                        job_id = %job_id,
                        attempt = attempts,
                        state = %observation.state,
                        "Polled job status"
                    );
                    if self.observe(&job_id, observation).await?.job.is_terminal() {
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if transient_failures > config.transient_retry_cap {
                        tracing::warn!(
                            job_id = %job_id,
                            failures = transient_failures,
                            error = %e,
                            "Provider unreachable, timing out job"
                        );
                        let reason = format!("provider unreachable: {e}");
                        self.observe(&job_id, Observation::timed_out(reason)).await?;
                        return Ok(());
                    }
                    tracing::debug!(
                        job_id = %job_id,
                        failures = transient_failures,
                        error = %e,
                        "Transient poll failure, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Provider rejected status query");
                    self.observe(&job_id, Observation::failed(e.to_string())).await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Removes a job from the poll table when its task ends, however it ends.
struct Registration {
    tracker: JobTracker,
    job_id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.polling().remove(&self.job_id);
    }
}
