//! Storage layer for the DUA credit ledger.
//!
//! This crate owns every piece of persistent state: balances, the mirror
//! balance table, the append-only transaction log, generation jobs and
//! invite codes. All balance mutations go through conditional primitives
//! that never read a balance in application code and write it back.
//!
//! # Backends
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`. Deductions are a single
//!   `UPDATE ... WHERE spendable_units >= $n` statement; refunds and invite
//!   redemptions are guarded by unique indexes and `WHERE active` predicates.
//! - [`MemoryStore`]: in-process backend for tests and local development.
//!   Every compound operation runs under one lock, so it has the same
//!   all-or-nothing semantics.
//!
//! # Example
//!
//! ```no_run
//! use dua_ledger_store::{MemoryStore, Store};
//! use dua_ledger_core::UserId;
//!
//! # async fn demo() -> dua_ledger_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! store.create_balance(&user_id, 100).await?;
//!
//! let tx = store.try_deduct(&user_id, 6, "music_generate_v5", None).await?;
//! assert_eq!(tx.balance_after, 94);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod sync;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use sync::{plan_propagation, SyncOutcome, SyncSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dua_ledger_core::{
    GenerationJob, InviteCode, JobId, MirrorBalance, Observation, ProviderJobId, ProviderKind,
    Transaction, Transition, UserBalance, UserId,
};

/// A job row together with the transition that produced it.
#[derive(Debug, Clone)]
pub struct ObservationOutcome {
    /// The job after the observation was applied.
    pub job: GenerationJob,
    /// What happened to it.
    pub transition: Transition,
}

/// Result of a successful invite redemption.
#[derive(Debug, Clone)]
pub struct Redemption {
    /// The now inactive code.
    pub invite: InviteCode,
    /// The welcome credit, absent when the welcome grant is zero.
    pub transaction: Option<Transaction>,
    /// Balance after the grant.
    pub balance: i64,
}

/// Aggregate spending figures for one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreditStats {
    /// Units removed by `deduction` rows.
    pub total_spent: i64,
    /// Units returned by `refund` rows.
    pub total_refunded: i64,
    /// Number of ledger rows of any kind.
    pub transaction_count: u64,
    /// Newest ledger row.
    pub last_transaction: Option<Transaction>,
}

/// The storage trait defining all ledger operations.
///
/// Implementations must make every method that touches more than one record
/// atomic: either all effects are visible or none are.
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip proving the backend answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    async fn ping(&self) -> Result<()>;

    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Create the primary and mirror balance rows for a user.
    ///
    /// A positive `initial_units` is recorded as a `credit` transaction.
    ///
    /// # Errors
    ///
    /// - `StoreError::Conflict` if the user already has a balance.
    /// - `StoreError::InvalidAmount` if `initial_units` is negative.
    async fn create_balance(&self, user_id: &UserId, initial_units: i64) -> Result<UserBalance>;

    /// Point-in-time read of the primary balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>>;

    /// Read the mirror balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_mirror_balance(&self, user_id: &UserId) -> Result<Option<MirrorBalance>>;

    /// Conditionally decrement the balance and append a `deduction`.
    ///
    /// The check and the decrement are one atomic step, so concurrent
    /// callers can never drive the balance below zero.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientFunds` if the balance is below `amount`.
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::InvalidAmount` unless `amount > 0`.
    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction>;

    /// Unconditionally increment the balance and append a `credit`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::InvalidAmount` unless `amount > 0`.
    async fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction>;

    /// Administrative overwrite of the primary balance.
    ///
    /// Records an `adjustment` carrying the signed difference and the admin
    /// identity. The mirror follows through the synchronizer.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::InvalidAmount` if `units` is negative.
    async fn admin_set_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<Transaction>;

    /// Direct write to the mirror table, as a legacy admin tool would do.
    ///
    /// The primary balance follows through the synchronizer and an
    /// `adjustment` is recorded.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::InvalidAmount` if `units` is negative.
    async fn admin_set_mirror_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
    ) -> Result<Transaction>;

    /// Compare the mirror with the primary and repair it if they differ.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user has no balance.
    async fn reconcile_mirror(&self, user_id: &UserId) -> Result<SyncOutcome>;

    // =========================================================================
    // Transaction Log
    // =========================================================================

    /// List a user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>>;

    /// Spending totals over the user's whole transaction log.
    ///
    /// Users without a balance get zeroed stats.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn credit_stats(&self, user_id: &UserId) -> Result<CreditStats>;

    /// All transactions linked to a job, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn transactions_for_job(&self, job_id: &JobId) -> Result<Vec<Transaction>>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Deduct `job.cost_reserved`, append the `deduction` and insert the
    /// job row in `SUBMITTED`, all in one unit of work.
    ///
    /// On insufficient funds nothing is written.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientFunds` if the balance is too low.
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::Conflict` if the job ID already exists.
    async fn reserve_job(&self, job: &GenerationJob) -> Result<Transaction>;

    /// Insert a job without touching the ledger (free services).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the job ID already exists.
    async fn insert_job(&self, job: &GenerationJob) -> Result<()>;

    /// Get a job by internal ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<GenerationJob>>;

    /// Resolve a provider task ID to the job it belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_job_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &ProviderJobId,
    ) -> Result<Option<GenerationJob>>;

    /// Record the provider task ID once dispatch succeeded.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the job doesn't exist.
    /// - `StoreError::Conflict` if a different provider ID is already set
    ///   or the provider ID belongs to another job.
    async fn attach_provider_job_id(
        &self,
        job_id: &JobId,
        provider_job_id: &ProviderJobId,
    ) -> Result<GenerationJob>;

    /// Apply an observation to a job with a conditional, monotonic update.
    ///
    /// Terminal writes succeed only from a non-terminal state, so when
    /// several observers race exactly one of them gets
    /// [`Transition::Finalized`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn record_observation(
        &self,
        job_id: &JobId,
        observation: &Observation,
    ) -> Result<ObservationOutcome>;

    /// Count a status poll. Returns the new attempt count.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn record_poll(&self, job_id: &JobId) -> Result<u32>;

    /// All jobs not yet in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_active_jobs(&self) -> Result<Vec<GenerationJob>>;

    /// Terminal jobs whose settlement has not completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_unsettled_jobs(&self) -> Result<Vec<GenerationJob>>;

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Refund `job.cost_reserved` unless a refund for this job already
    /// exists. Returns `None` when one did.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user has no balance.
    async fn refund_once(&self, job: &GenerationJob) -> Result<Option<Transaction>>;

    /// Set `settled_at` if it is still unset. Returns whether this call set it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn mark_settled(&self, job_id: &JobId, at: DateTime<Utc>) -> Result<bool>;

    // =========================================================================
    // Invite Codes
    // =========================================================================

    /// Insert invite codes, skipping ones that already exist. Returns the
    /// codes actually created.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn create_invites(&self, invites: &[InviteCode]) -> Result<Vec<InviteCode>>;

    /// Get an invite code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>>;

    /// Redeem a code for a user: flip `active` to false with a conditional
    /// update, create the user's balance if missing and credit
    /// `welcome_units`, all in one unit of work.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the code doesn't exist.
    /// - `StoreError::InviteAlreadyUsed` if it was already redeemed.
    async fn redeem_invite(
        &self,
        code: &str,
        user_id: &UserId,
        welcome_units: i64,
    ) -> Result<Redemption>;
}
