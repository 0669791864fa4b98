//! In-memory storage implementation.
//!
//! All state lives behind a single mutex. Each trait method takes the lock
//! once and performs its checks and writes before releasing it, which gives
//! every compound operation the same atomicity the PostgreSQL backend gets
//! from a database transaction.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use dua_ledger_core::{
    GenerationJob, InviteCode, JobId, MirrorBalance, Observation, ProviderJobId, ProviderKind,
    Transaction, TransactionKind, UserBalance, UserId,
};

use crate::error::{Result, StoreError};
use crate::sync::{plan_propagation, SyncOutcome, SyncSource};
use crate::{CreditStats, ObservationOutcome, Redemption, Store};

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, UserBalance>,
    mirrors: HashMap<UserId, MirrorBalance>,
    transactions: Vec<Transaction>,
    refunded_jobs: HashSet<JobId>,
    jobs: HashMap<JobId, GenerationJob>,
    provider_index: HashMap<(ProviderKind, ProviderJobId), JobId>,
    invites: HashMap<String, InviteCode>,
}

impl Inner {
    fn balance_mut(&mut self, user_id: &UserId) -> Result<&mut UserBalance> {
        self.balances
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found("balance", user_id))
    }

    /// Write the primary balance and let the synchronizer update the mirror.
    fn set_primary(&mut self, user_id: &UserId, units: i64) -> Result<()> {
        let now = Utc::now();
        let balance = self.balance_mut(user_id)?;
        balance.spendable_units = units;
        balance.updated_at = now;
        self.propagate(SyncSource::Primary, user_id, units, now);
        Ok(())
    }

    fn propagate(&mut self, source: SyncSource, user_id: &UserId, units: i64, now: DateTime<Utc>) {
        match source {
            SyncSource::Primary => {
                let current = self.mirrors.get(user_id).map(|m| m.spendable_units);
                if let Some(units) = plan_propagation(source, units, current) {
                    let mirror = self.mirrors.entry(*user_id).or_insert(MirrorBalance {
                        user_id: *user_id,
                        spendable_units: units,
                        updated_at: now,
                    });
                    mirror.spendable_units = units;
                    mirror.updated_at = now;
                }
            }
            SyncSource::Mirror => {
                let current = self.balances.get(user_id).map(|b| b.spendable_units);
                if let Some(units) = plan_propagation(source, units, current) {
                    if let Some(balance) = self.balances.get_mut(user_id) {
                        balance.spendable_units = units;
                        balance.updated_at = now;
                    }
                }
            }
        }
    }

    fn append(&mut self, transaction: Transaction) -> Transaction {
        if transaction.kind == TransactionKind::Refund {
            if let Some(job_id) = transaction.linked_job_id {
                self.refunded_jobs.insert(job_id);
            }
        }
        self.transactions.push(transaction.clone());
        transaction
    }

    fn deduct(
        &mut self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction> {
        let transaction = Transaction::deduction(*user_id, amount, reason, linked_job_id)?;
        let balance = self.balance_mut(user_id)?;
        if balance.spendable_units < amount {
            return Err(StoreError::InsufficientFunds {
                balance: balance.spendable_units,
                required: amount,
            });
        }
        let new_units = balance.after_delta(-amount)?;
        self.set_primary(user_id, new_units)?;
        Ok(self.append(transaction.with_balance_after(new_units)))
    }

    fn add(&mut self, transaction: Transaction) -> Result<Transaction> {
        let user_id = transaction.user_id;
        let balance = self.balance_mut(&user_id)?;
        let new_units = balance.after_delta(transaction.amount_delta)?;
        self.set_primary(&user_id, new_units)?;
        Ok(self.append(transaction.with_balance_after(new_units)))
    }

    fn insert_balance(&mut self, user_id: &UserId, units: i64) -> UserBalance {
        let balance = UserBalance::new(*user_id, units);
        self.balances.insert(*user_id, balance.clone());
        self.propagate(SyncSource::Primary, user_id, units, balance.updated_at);
        balance
    }

    fn insert_job(&mut self, job: &GenerationJob) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        if let Some(provider_job_id) = &job.provider_job_id {
            self.provider_index
                .insert((job.provider, provider_job_id.clone()), job.id);
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn job_mut(&mut self, job_id: &JobId) -> Result<&mut GenerationJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))
    }
}

/// In-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".to_string()))
    }

    /// Overwrite the mirror without running the synchronizer, the way an
    /// out-of-band writer would. Used to exercise divergence repair.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user has no mirror row.
    pub fn inject_mirror_drift(&self, user_id: &UserId, units: i64) -> Result<()> {
        let mut inner = self.lock()?;
        let mirror = inner
            .mirrors
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found("mirror balance", user_id))?;
        mirror.spendable_units = units;
        Ok(())
    }
}

fn non_negative(units: i64) -> Result<i64> {
    if units < 0 {
        return Err(StoreError::InvalidAmount(format!(
            "balance must not be negative, got {units}"
        )));
    }
    Ok(units)
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.lock().map(drop)
    }

    // =========================================================================
    // Balance Operations
    // =========================================================================

    async fn create_balance(&self, user_id: &UserId, initial_units: i64) -> Result<UserBalance> {
        non_negative(initial_units)?;
        let mut inner = self.lock()?;
        if inner.balances.contains_key(user_id) {
            return Err(StoreError::Conflict(format!(
                "balance for user {user_id} already exists"
            )));
        }
        let balance = inner.insert_balance(user_id, 0);
        if initial_units == 0 {
            return Ok(balance);
        }
        inner.add(Transaction::credit(*user_id, initial_units, "initial grant", None)?)?;
        inner
            .balances
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("balance", user_id))
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>> {
        Ok(self.lock()?.balances.get(user_id).cloned())
    }

    async fn get_mirror_balance(&self, user_id: &UserId) -> Result<Option<MirrorBalance>> {
        Ok(self.lock()?.mirrors.get(user_id).cloned())
    }

    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction> {
        self.lock()?.deduct(user_id, amount, reason, linked_job_id)
    }

    async fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction> {
        let transaction = Transaction::credit(*user_id, amount, reason, linked_job_id)?;
        self.lock()?.add(transaction)
    }

    async fn admin_set_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<Transaction> {
        non_negative(units)?;
        let mut inner = self.lock()?;
        let previous = inner.balance_mut(user_id)?.spendable_units;
        inner.set_primary(user_id, units)?;
        let transaction = Transaction::adjustment(*user_id, units - previous, reason)
            .with_metadata(serde_json::json!({ "admin_id": admin_id, "path": "primary" }))
            .with_balance_after(units);
        Ok(inner.append(transaction))
    }

    async fn admin_set_mirror_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
    ) -> Result<Transaction> {
        non_negative(units)?;
        let mut inner = self.lock()?;
        let previous = inner.balance_mut(user_id)?.spendable_units;
        let now = Utc::now();
        let mirror = inner.mirrors.entry(*user_id).or_insert(MirrorBalance {
            user_id: *user_id,
            spendable_units: units,
            updated_at: now,
        });
        mirror.spendable_units = units;
        mirror.updated_at = now;
        inner.propagate(SyncSource::Mirror, user_id, units, now);
        let transaction = Transaction::adjustment(*user_id, units - previous, "mirror overwrite")
            .with_metadata(serde_json::json!({ "admin_id": admin_id, "path": "mirror" }))
            .with_balance_after(units);
        Ok(inner.append(transaction))
    }

    async fn reconcile_mirror(&self, user_id: &UserId) -> Result<SyncOutcome> {
        let mut inner = self.lock()?;
        let units = inner.balance_mut(user_id)?.spendable_units;
        let mirror_was = inner.mirrors.get(user_id).map(|m| m.spendable_units);
        if mirror_was == Some(units) {
            return Ok(SyncOutcome::InSync { units });
        }
        warn!(
            user_id = %user_id,
            primary = units,
            mirror = ?mirror_was,
            "Mirror balance diverged from primary, repairing"
        );
        inner.propagate(SyncSource::Primary, user_id, units, Utc::now());
        Ok(SyncOutcome::Repaired { units, mirror_was })
    }

    // =========================================================================
    // Transaction Log
    // =========================================================================

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let inner = self.lock()?;
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == *user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn credit_stats(&self, user_id: &UserId) -> Result<CreditStats> {
        let inner = self.lock()?;
        let mut stats = CreditStats::default();
        for tx in inner.transactions.iter().filter(|tx| tx.user_id == *user_id) {
            match tx.kind {
                TransactionKind::Deduction => stats.total_spent += -tx.amount_delta,
                TransactionKind::Refund => stats.total_refunded += tx.amount_delta,
                TransactionKind::Credit | TransactionKind::Adjustment => {}
            }
            stats.transaction_count += 1;
            stats.last_transaction = Some(tx.clone());
        }
        Ok(stats)
    }

    async fn transactions_for_job(&self, job_id: &JobId) -> Result<Vec<Transaction>> {
        let inner = self.lock()?;
        Ok(inner
            .transactions
            .iter()
            .filter(|tx| tx.linked_job_id == Some(*job_id))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    async fn reserve_job(&self, job: &GenerationJob) -> Result<Transaction> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        let transaction =
            inner.deduct(&job.user_id, job.cost_reserved, &job.service_code, Some(job.id))?;
        inner.insert_job(job)?;
        Ok(transaction)
    }

    async fn insert_job(&self, job: &GenerationJob) -> Result<()> {
        self.lock()?.insert_job(job)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<GenerationJob>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn find_job_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &ProviderJobId,
    ) -> Result<Option<GenerationJob>> {
        let inner = self.lock()?;
        Ok(inner
            .provider_index
            .get(&(provider, provider_job_id.clone()))
            .and_then(|job_id| inner.jobs.get(job_id))
            .cloned())
    }

    async fn attach_provider_job_id(
        &self,
        job_id: &JobId,
        provider_job_id: &ProviderJobId,
    ) -> Result<GenerationJob> {
        let mut inner = self.lock()?;
        let provider = inner.job_mut(job_id)?.provider;
        let key = (provider, provider_job_id.clone());
        if let Some(owner) = inner.provider_index.get(&key) {
            if owner != job_id {
                return Err(StoreError::Conflict(format!(
                    "provider job {provider_job_id} already belongs to job {owner}"
                )));
            }
        }
        let job = inner.job_mut(job_id)?;
        match &job.provider_job_id {
            Some(existing) if existing != provider_job_id => {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} already has provider job {existing}"
                )));
            }
            Some(_) => return Ok(job.clone()),
            None => {}
        }
        job.provider_job_id = Some(provider_job_id.clone());
        job.updated_at = Utc::now();
        let job = job.clone();
        inner.provider_index.insert(key, *job_id);
        Ok(job)
    }

    async fn record_observation(
        &self,
        job_id: &JobId,
        observation: &Observation,
    ) -> Result<ObservationOutcome> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(job_id)?;
        let transition = job.apply(observation);
        Ok(ObservationOutcome {
            job: job.clone(),
            transition,
        })
    }

    async fn record_poll(&self, job_id: &JobId) -> Result<u32> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(job_id)?;
        job.poll_attempts += 1;
        job.last_polled_at = Some(Utc::now());
        Ok(job.poll_attempts)
    }

    async fn list_active_jobs(&self) -> Result<Vec<GenerationJob>> {
        let inner = self.lock()?;
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn list_unsettled_jobs(&self) -> Result<Vec<GenerationJob>> {
        let inner = self.lock()?;
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.is_terminal() && !job.is_settled())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    async fn refund_once(&self, job: &GenerationJob) -> Result<Option<Transaction>> {
        let mut inner = self.lock()?;
        if inner.refunded_jobs.contains(&job.id) {
            debug!(job_id = %job.id, "Refund already recorded, skipping");
            return Ok(None);
        }
        let transaction = Transaction::refund(job.user_id, job.cost_reserved, job.id)?;
        inner.add(transaction).map(Some)
    }

    async fn mark_settled(&self, job_id: &JobId, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(job_id)?;
        if job.settled_at.is_some() {
            return Ok(false);
        }
        job.settled_at = Some(at);
        job.updated_at = at;
        Ok(true)
    }

    // =========================================================================
    // Invite Codes
    // =========================================================================

    async fn create_invites(&self, invites: &[InviteCode]) -> Result<Vec<InviteCode>> {
        let mut inner = self.lock()?;
        let mut created = Vec::new();
        for invite in invites {
            if inner.invites.contains_key(&invite.code) {
                continue;
            }
            inner.invites.insert(invite.code.clone(), invite.clone());
            created.push(invite.clone());
        }
        Ok(created)
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>> {
        Ok(self.lock()?.invites.get(code).cloned())
    }

    async fn redeem_invite(
        &self,
        code: &str,
        user_id: &UserId,
        welcome_units: i64,
    ) -> Result<Redemption> {
        non_negative(welcome_units)?;
        let mut inner = self.lock()?;
        // Validate the grant before the code is spent.
        if let Some(balance) = inner.balances.get(user_id) {
            balance.after_delta(welcome_units)?;
        }
        let invite = inner
            .invites
            .get_mut(code)
            .ok_or_else(|| StoreError::not_found("invite", code))?;
        if !invite.active {
            return Err(StoreError::InviteAlreadyUsed {
                code: code.to_string(),
            });
        }
        let now = Utc::now();
        invite.active = false;
        invite.used_by = Some(*user_id);
        invite.used_at = Some(now);
        let invite = invite.clone();

        if !inner.balances.contains_key(user_id) {
            inner.insert_balance(user_id, 0);
        }
        let transaction = if welcome_units > 0 {
            let credit = Transaction::credit(
                *user_id,
                welcome_units,
                format!("invite:{code}"),
                None,
            )?;
            Some(inner.add(credit)?)
        } else {
            None
        };
        let balance = inner.balance_mut(user_id)?.spendable_units;
        Ok(Redemption {
            invite,
            transaction,
            balance,
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}
