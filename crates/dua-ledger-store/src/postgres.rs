//! PostgreSQL storage implementation.
//!
//! Every guard the ledger depends on is executed by the database as a
//! single conditional statement:
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | `try_deduct`, `reserve_job` | `UPDATE ... WHERE spendable_units >= $n` |
//! | `refund_once` | unique partial index on refund `linked_job_id` |
//! | `record_observation` | `WHERE state = ANY(<allowed predecessors>)` |
//! | `mark_settled` | `WHERE settled_at IS NULL` |
//! | `redeem_invite` | `WHERE active = TRUE` |
//!
//! Reads that follow a failed guard only classify the error; nothing is
//! ever written based on a value read in application code.
//!
//! ## Error Mapping
//!
//! | `PostgreSQL` code | `StoreError` |
//! |-------------------|--------------|
//! | `23505` unique violation | `Conflict` |
//! | `23514` check violation | `InvalidAmount` |
//! | anything else | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};

use dua_ledger_core::{
    GenerationJob, InviteCode, JobId, JobState, MirrorBalance, Observation, ProviderJobId,
    ProviderKind, Transaction, TransactionId, TransactionKind, Transition, UserBalance, UserId,
};

use crate::error::{Result, StoreError};
use crate::sync::{plan_propagation, SyncOutcome, SyncSource};
use crate::{CreditStats, ObservationOutcome, Redemption, Store};

const JOB_COLUMNS: &str = "id, user_id, service_code, provider, provider_job_id, cost_reserved, \
     state, params, result_payload, failure_reason, poll_attempts, created_at, updated_at, \
     last_polled_at, settled_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount_delta, kind, reason, linked_job_id, balance_after, metadata, created_at";

/// PostgreSQL-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the pool cannot connect.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Error mapping and row decoding
// =============================================================================

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let msg = format!("{operation}: {}", db_err.message());
        return match db_err.code().as_deref() {
            Some("23505") => StoreError::Conflict(msg),
            Some("23514") => StoreError::InvalidAmount(msg),
            // numeric_value_out_of_range: bigint overflow on a credit
            Some("22003") => StoreError::InvalidAmount(msg),
            _ => StoreError::Database(msg),
        };
    }
    StoreError::Database(format!("{operation}: {err}"))
}

fn decode_err(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(err.to_string())
}

fn parse_job_id(value: &str) -> Result<JobId> {
    value
        .parse()
        .map_err(|e| StoreError::Serialization(format!("bad job id {value}: {e}")))
}

fn balance_from_row(row: &PgRow) -> Result<UserBalance> {
    Ok(UserBalance {
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode_err)?),
        spendable_units: row.try_get("spendable_units").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let kind: String = row.try_get("kind").map_err(decode_err)?;
    let linked: Option<String> = row.try_get("linked_job_id").map_err(decode_err)?;
    let metadata: Json<serde_json::Value> = row.try_get("metadata").map_err(decode_err)?;
    Ok(Transaction {
        id: id
            .parse::<TransactionId>()
            .map_err(|e| StoreError::Serialization(format!("bad transaction id {id}: {e}")))?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode_err)?),
        amount_delta: row.try_get("amount_delta").map_err(decode_err)?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| StoreError::Serialization(format!("unknown transaction kind {kind}")))?,
        reason: row.try_get("reason").map_err(decode_err)?,
        linked_job_id: linked.as_deref().map(parse_job_id).transpose()?,
        balance_after: row.try_get("balance_after").map_err(decode_err)?,
        metadata: metadata.0,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<GenerationJob> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let provider: String = row.try_get("provider").map_err(decode_err)?;
    let state: String = row.try_get("state").map_err(decode_err)?;
    let provider_job_id: Option<String> = row.try_get("provider_job_id").map_err(decode_err)?;
    let params: Json<serde_json::Value> = row.try_get("params").map_err(decode_err)?;
    let result_payload: Option<Json<serde_json::Value>> =
        row.try_get("result_payload").map_err(decode_err)?;
    let poll_attempts: i32 = row.try_get("poll_attempts").map_err(decode_err)?;
    Ok(GenerationJob {
        id: parse_job_id(&id)?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode_err)?),
        service_code: row.try_get("service_code").map_err(decode_err)?,
        provider: ProviderKind::parse(&provider)
            .ok_or_else(|| StoreError::Serialization(format!("unknown provider {provider}")))?,
        provider_job_id: provider_job_id
            .map(ProviderJobId::new)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        cost_reserved: row.try_get("cost_reserved").map_err(decode_err)?,
        state: JobState::parse(&state)
            .ok_or_else(|| StoreError::Serialization(format!("unknown job state {state}")))?,
        params: params.0,
        result_payload: result_payload.map(|json| json.0),
        failure_reason: row.try_get("failure_reason").map_err(decode_err)?,
        poll_attempts: u32::try_from(poll_attempts).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
        last_polled_at: row.try_get("last_polled_at").map_err(decode_err)?,
        settled_at: row.try_get("settled_at").map_err(decode_err)?,
    })
}

fn invite_from_row(row: &PgRow) -> Result<InviteCode> {
    let used_by: Option<uuid::Uuid> = row.try_get("used_by").map_err(decode_err)?;
    Ok(InviteCode {
        code: row.try_get("code").map_err(decode_err)?,
        active: row.try_get("active").map_err(decode_err)?,
        used_by: used_by.map(UserId::from_uuid),
        used_at: row.try_get("used_at").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

/// States an observation of `observed` may be written over.
fn predecessors(observed: JobState) -> Vec<String> {
    JobState::ACTIVE
        .iter()
        .filter(|state| state.rank() < observed.rank())
        .map(|state| state.as_str().to_string())
        .collect()
}

fn active_states() -> Vec<String> {
    JobState::ACTIVE
        .iter()
        .map(|state| state.as_str().to_string())
        .collect()
}

// =============================================================================
// Statement helpers (run inside a caller-owned transaction)
// =============================================================================

async fn insert_transaction(conn: &mut PgConnection, tx: &Transaction) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO ledger_transactions
            (id, user_id, amount_delta, kind, reason, linked_job_id, balance_after, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(tx.id.to_string())
    .bind(*tx.user_id.as_uuid())
    .bind(tx.amount_delta)
    .bind(tx.kind.as_str())
    .bind(&tx.reason)
    .bind(tx.linked_job_id.map(|id| id.to_string()))
    .bind(tx.balance_after)
    .bind(Json(&tx.metadata))
    .bind(tx.created_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_transaction", e))?;
    Ok(())
}

/// Copy the primary value to the mirror when they differ.
async fn propagate_to_mirror(conn: &mut PgConnection, user_id: &UserId, units: i64) -> Result<()> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT spendable_units FROM mirror_balances WHERE user_id = $1 FOR UPDATE",
    )
    .bind(*user_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("read_mirror", e))?;

    if let Some(units) = plan_propagation(SyncSource::Primary, units, current) {
        sqlx::query(
            r"
            INSERT INTO mirror_balances (user_id, spendable_units, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET spendable_units = EXCLUDED.spendable_units, updated_at = NOW()
            ",
        )
        .bind(*user_id.as_uuid())
        .bind(units)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("write_mirror", e))?;
    }
    Ok(())
}

/// Copy a mirror value back to the primary when they differ.
async fn propagate_to_primary(conn: &mut PgConnection, user_id: &UserId, units: i64) -> Result<()> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT spendable_units FROM user_balances WHERE user_id = $1 FOR UPDATE",
    )
    .bind(*user_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("read_primary", e))?;

    if current.is_none() {
        return Err(StoreError::not_found("balance", user_id));
    }
    if let Some(units) = plan_propagation(SyncSource::Mirror, units, current) {
        sqlx::query(
            "UPDATE user_balances SET spendable_units = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(*user_id.as_uuid())
        .bind(units)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("write_primary", e))?;
    }
    Ok(())
}

/// Conditional decrement. Returns the new balance.
async fn conditional_deduct(conn: &mut PgConnection, user_id: &UserId, amount: i64) -> Result<i64> {
    let updated: Option<i64> = sqlx::query_scalar(
        r"
        UPDATE user_balances
        SET spendable_units = spendable_units - $2, updated_at = NOW()
        WHERE user_id = $1 AND spendable_units >= $2
        RETURNING spendable_units
        ",
    )
    .bind(*user_id.as_uuid())
    .bind(amount)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("deduct", e))?;

    if let Some(balance) = updated {
        return Ok(balance);
    }

    // Guard failed; read only to report why.
    let current: Option<i64> =
        sqlx::query_scalar("SELECT spendable_units FROM user_balances WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("deduct_classify", e))?;
    match current {
        Some(balance) => Err(StoreError::InsufficientFunds {
            balance,
            required: amount,
        }),
        None => Err(StoreError::not_found("balance", user_id)),
    }
}

/// Unconditional increment. Returns the new balance.
async fn increment(conn: &mut PgConnection, user_id: &UserId, amount: i64) -> Result<i64> {
    let updated: Option<i64> = sqlx::query_scalar(
        r"
        UPDATE user_balances
        SET spendable_units = spendable_units + $2, updated_at = NOW()
        WHERE user_id = $1
        RETURNING spendable_units
        ",
    )
    .bind(*user_id.as_uuid())
    .bind(amount)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("increment", e))?;
    updated.ok_or_else(|| StoreError::not_found("balance", user_id))
}

async fn insert_job_row(conn: &mut PgConnection, job: &GenerationJob) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO generation_jobs
            (id, user_id, service_code, provider, provider_job_id, cost_reserved, state,
             params, result_payload, failure_reason, poll_attempts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ",
    )
    .bind(job.id.to_string())
    .bind(*job.user_id.as_uuid())
    .bind(&job.service_code)
    .bind(job.provider.as_str())
    .bind(job.provider_job_id.as_ref().map(ProviderJobId::as_str))
    .bind(job.cost_reserved)
    .bind(job.state.as_str())
    .bind(Json(&job.params))
    .bind(job.result_payload.as_ref().map(Json))
    .bind(job.failure_reason.as_deref())
    .bind(i32::try_from(job.poll_attempts).unwrap_or(i32::MAX))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

fn non_negative(units: i64) -> Result<()> {
    if units < 0 {
        return Err(StoreError::InvalidAmount(format!(
            "balance must not be negative, got {units}"
        )));
    }
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }

    // =========================================================================
    // Balance Operations
    // =========================================================================

    async fn create_balance(&self, user_id: &UserId, initial_units: i64) -> Result<UserBalance> {
        non_negative(initial_units)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("INSERT INTO user_balances (user_id, spendable_units) VALUES ($1, 0)")
            .bind(*user_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| match map_sqlx_error("create_balance", e) {
                StoreError::Conflict(_) => {
                    StoreError::Conflict(format!("balance for user {user_id} already exists"))
                }
                other => other,
            })?;
        propagate_to_mirror(&mut tx, user_id, 0).await?;

        if initial_units > 0 {
            let balance_after = increment(&mut tx, user_id, initial_units).await?;
            let grant = Transaction::credit(*user_id, initial_units, "initial grant", None)?
                .with_balance_after(balance_after);
            insert_transaction(&mut tx, &grant).await?;
            propagate_to_mirror(&mut tx, user_id, balance_after).await?;
        }

        let row = sqlx::query("SELECT * FROM user_balances WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_balance_read", e))?;
        let balance = balance_from_row(&row)?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(balance)
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>> {
        sqlx::query("SELECT * FROM user_balances WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_balance", e))?
            .as_ref()
            .map(balance_from_row)
            .transpose()
    }

    async fn get_mirror_balance(&self, user_id: &UserId) -> Result<Option<MirrorBalance>> {
        let row = sqlx::query("SELECT * FROM mirror_balances WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_mirror_balance", e))?;
        row.map(|row| {
            Ok(MirrorBalance {
                user_id: *user_id,
                spendable_units: row.try_get("spendable_units").map_err(decode_err)?,
                updated_at: row.try_get("updated_at").map_err(decode_err)?,
            })
        })
        .transpose()
    }

    async fn try_deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction> {
        let transaction = Transaction::deduction(*user_id, amount, reason, linked_job_id)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let balance_after = conditional_deduct(&mut tx, user_id, amount).await?;
        let transaction = transaction.with_balance_after(balance_after);
        insert_transaction(&mut tx, &transaction).await?;
        propagate_to_mirror(&mut tx, user_id, balance_after).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transaction)
    }

    async fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: &str,
        linked_job_id: Option<JobId>,
    ) -> Result<Transaction> {
        let transaction = Transaction::credit(*user_id, amount, reason, linked_job_id)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let balance_after = increment(&mut tx, user_id, amount).await?;
        let transaction = transaction.with_balance_after(balance_after);
        insert_transaction(&mut tx, &transaction).await?;
        propagate_to_mirror(&mut tx, user_id, balance_after).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transaction)
    }

    async fn admin_set_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<Transaction> {
        non_negative(units)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // One statement: lock, overwrite and report the previous value.
        let previous: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE user_balances b
            SET spendable_units = $2, updated_at = NOW()
            FROM (SELECT user_id, spendable_units FROM user_balances WHERE user_id = $1 FOR UPDATE) old
            WHERE b.user_id = old.user_id
            RETURNING old.spendable_units
            ",
        )
        .bind(*user_id.as_uuid())
        .bind(units)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("admin_set_balance", e))?;
        let previous = previous.ok_or_else(|| StoreError::not_found("balance", user_id))?;

        let adjustment = Transaction::adjustment(*user_id, units - previous, reason)
            .with_metadata(serde_json::json!({ "admin_id": admin_id, "path": "primary" }))
            .with_balance_after(units);
        insert_transaction(&mut tx, &adjustment).await?;
        propagate_to_mirror(&mut tx, user_id, units).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(adjustment)
    }

    async fn admin_set_mirror_balance(
        &self,
        user_id: &UserId,
        units: i64,
        admin_id: &str,
    ) -> Result<Transaction> {
        non_negative(units)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let previous: Option<i64> = sqlx::query_scalar(
            "SELECT spendable_units FROM user_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(*user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("admin_set_mirror_balance", e))?;
        let previous = previous.ok_or_else(|| StoreError::not_found("balance", user_id))?;

        sqlx::query(
            r"
            INSERT INTO mirror_balances (user_id, spendable_units, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET spendable_units = EXCLUDED.spendable_units, updated_at = NOW()
            ",
        )
        .bind(*user_id.as_uuid())
        .bind(units)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_mirror", e))?;
        propagate_to_primary(&mut tx, user_id, units).await?;

        let adjustment = Transaction::adjustment(*user_id, units - previous, "mirror overwrite")
            .with_metadata(serde_json::json!({ "admin_id": admin_id, "path": "mirror" }))
            .with_balance_after(units);
        insert_transaction(&mut tx, &adjustment).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(adjustment)
    }

    async fn reconcile_mirror(&self, user_id: &UserId) -> Result<SyncOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let units: Option<i64> = sqlx::query_scalar(
            "SELECT spendable_units FROM user_balances WHERE user_id = $1 FOR SHARE",
        )
        .bind(*user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reconcile_primary", e))?;
        let units = units.ok_or_else(|| StoreError::not_found("balance", user_id))?;

        let mirror_was: Option<i64> = sqlx::query_scalar(
            "SELECT spendable_units FROM mirror_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(*user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reconcile_mirror", e))?;

        if mirror_was == Some(units) {
            return Ok(SyncOutcome::InSync { units });
        }
        warn!(
            user_id = %user_id,
            primary = units,
            mirror = ?mirror_was,
            "Mirror balance diverged from primary, repairing"
        );
        propagate_to_mirror(&mut tx, user_id, units).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
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
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&query)
            .bind(*user_id.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_transactions", e))?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn credit_stats(&self, user_id: &UserId) -> Result<CreditStats> {
        let row = sqlx::query(
            r"
            SELECT
                COALESCE(SUM(-amount_delta) FILTER (WHERE kind = 'deduction'), 0)::BIGINT
                    AS total_spent,
                COALESCE(SUM(amount_delta) FILTER (WHERE kind = 'refund'), 0)::BIGINT
                    AS total_refunded,
                COUNT(*) AS transaction_count
            FROM ledger_transactions
            WHERE user_id = $1
            ",
        )
        .bind(*user_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("credit_stats", e))?;

        let count: i64 = row.get("transaction_count");
        let last_transaction = self.list_transactions(user_id, 1, 0).await?.pop();
        Ok(CreditStats {
            total_spent: row.get("total_spent"),
            total_refunded: row.get("total_refunded"),
            transaction_count: u64::try_from(count).unwrap_or(0),
            last_transaction,
        })
    }

    async fn transactions_for_job(&self, job_id: &JobId) -> Result<Vec<Transaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions WHERE linked_job_id = $1 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transactions_for_job", e))?;
        rows.iter().map(transaction_from_row).collect()
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    async fn reserve_job(&self, job: &GenerationJob) -> Result<Transaction> {
        let deduction = Transaction::deduction(
            job.user_id,
            job.cost_reserved,
            job.service_code.clone(),
            Some(job.id),
        )?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let balance_after = conditional_deduct(&mut tx, &job.user_id, job.cost_reserved).await?;
        let deduction = deduction.with_balance_after(balance_after);
        insert_transaction(&mut tx, &deduction).await?;
        propagate_to_mirror(&mut tx, &job.user_id, balance_after).await?;
        insert_job_row(&mut tx, job).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(deduction)
    }

    async fn insert_job(&self, job: &GenerationJob) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_job_row(&mut conn, job).await
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<GenerationJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        sqlx::query(&query)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn find_job_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &ProviderJobId,
    ) -> Result<Option<GenerationJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE provider = $1 AND provider_job_id = $2"
        );
        sqlx::query(&query)
            .bind(provider.as_str())
            .bind(provider_job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job_by_provider_id", e))?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn attach_provider_job_id(
        &self,
        job_id: &JobId,
        provider_job_id: &ProviderJobId,
    ) -> Result<GenerationJob> {
        let query = format!(
            "UPDATE generation_jobs SET provider_job_id = $2, updated_at = NOW() \
             WHERE id = $1 AND (provider_job_id IS NULL OR provider_job_id = $2) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job_id.to_string())
            .bind(provider_job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("attach_provider_job_id", e))?;
        if let Some(row) = row {
            return job_from_row(&row);
        }
        match self.get_job(job_id).await? {
            Some(job) => Err(StoreError::Conflict(format!(
                "job {job_id} already has provider job {}",
                job.provider_job_id
                    .as_ref()
                    .map_or("<none>", ProviderJobId::as_str)
            ))),
            None => Err(StoreError::not_found("job", job_id)),
        }
    }

    async fn record_observation(
        &self,
        job_id: &JobId,
        observation: &Observation,
    ) -> Result<ObservationOutcome> {
        let query = format!(
            r"
            WITH prev AS (
                SELECT id, state FROM generation_jobs WHERE id = $1 FOR UPDATE
            )
            UPDATE generation_jobs j
            SET state = $2,
                result_payload = COALESCE($3, j.result_payload),
                failure_reason = COALESCE($4, j.failure_reason),
                updated_at = NOW()
            FROM prev
            WHERE j.id = prev.id AND prev.state = ANY($5)
            RETURNING prev.state AS prev_state, {}
            ",
            JOB_COLUMNS
                .split(", ")
                .map(|column| format!("j.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&query)
            .bind(job_id.to_string())
            .bind(observation.state.as_str())
            .bind(observation.result_payload.as_ref().map(Json))
            .bind(observation.failure_reason.as_deref())
            .bind(predecessors(observation.state))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_observation", e))?;

        if let Some(row) = row {
            let prev: String = row.try_get("prev_state").map_err(decode_err)?;
            let from = JobState::parse(&prev)
                .ok_or_else(|| StoreError::Serialization(format!("unknown job state {prev}")))?;
            let job = job_from_row(&row)?;
            return Ok(ObservationOutcome {
                transition: Transition::plan(from, observation.state),
                job,
            });
        }

        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        let transition = match Transition::plan(job.state, observation.state) {
            // A concurrent writer moved the job after our guard failed; our
            // observation was still not applied.
            planned if planned.changed() => Transition::Ignored {
                current: job.state,
                observed: observation.state,
            },
            planned => planned,
        };
        debug!(job_id = %job_id, ?transition, "Observation not applied");
        Ok(ObservationOutcome { job, transition })
    }

    async fn record_poll(&self, job_id: &JobId) -> Result<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE generation_jobs
            SET poll_attempts = poll_attempts + 1, last_polled_at = NOW()
            WHERE id = $1
            RETURNING poll_attempts
            ",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_poll", e))?;
        attempts
            .map(|n| u32::try_from(n).unwrap_or_default())
            .ok_or_else(|| StoreError::not_found("job", job_id))
    }

    async fn list_active_jobs(&self) -> Result<Vec<GenerationJob>> {
        let query =
            format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE state = ANY($1) ORDER BY id");
        let rows = sqlx::query(&query)
            .bind(active_states())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_active_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_unsettled_jobs(&self) -> Result<Vec<GenerationJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE settled_at IS NULL AND NOT (state = ANY($1)) ORDER BY id"
        );
        let rows = sqlx::query(&query)
            .bind(active_states())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_unsettled_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    async fn refund_once(&self, job: &GenerationJob) -> Result<Option<Transaction>> {
        let refund = Transaction::refund(job.user_id, job.cost_reserved, job.id)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let balance_after = increment(&mut tx, &job.user_id, job.cost_reserved).await?;
        let refund = refund.with_balance_after(balance_after);

        // A concurrent refund for the same job blocks here on the unique
        // index and then inserts nothing.
        let inserted: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO ledger_transactions
                (id, user_id, amount_delta, kind, reason, linked_job_id, balance_after, metadata, created_at)
            VALUES ($1, $2, $3, 'refund', $4, $5, $6, $7, $8)
            ON CONFLICT (linked_job_id) WHERE kind = 'refund' DO NOTHING
            RETURNING id
            ",
        )
        .bind(refund.id.to_string())
        .bind(*refund.user_id.as_uuid())
        .bind(refund.amount_delta)
        .bind(&refund.reason)
        .bind(job.id.to_string())
        .bind(refund.balance_after)
        .bind(Json(&refund.metadata))
        .bind(refund.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("refund_once", e))?;

        if inserted.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(job_id = %job.id, "Refund already recorded, skipping");
            return Ok(None);
        }

        propagate_to_mirror(&mut tx, &job.user_id, balance_after).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Some(refund))
    }

    async fn mark_settled(&self, job_id: &JobId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET settled_at = $2, updated_at = $2 \
             WHERE id = $1 AND settled_at IS NULL",
        )
        .bind(job_id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_settled", e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found("job", job_id)),
        }
    }

    // =========================================================================
    // Invite Codes
    // =========================================================================

    async fn create_invites(&self, invites: &[InviteCode]) -> Result<Vec<InviteCode>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        let mut created = Vec::with_capacity(invites.len());
        for invite in invites {
            let row = sqlx::query(
                r"
                INSERT INTO invite_codes (code, active, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (code) DO NOTHING
                RETURNING code, active, used_by, used_at, created_at
                ",
            )
            .bind(&invite.code)
            .bind(invite.active)
            .bind(invite.created_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_invites", e))?;
            if let Some(row) = row {
                created.push(invite_from_row(&row)?);
            }
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(created)
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>> {
        sqlx::query("SELECT code, active, used_by, used_at, created_at FROM invite_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_invite", e))?
            .as_ref()
            .map(invite_from_row)
            .transpose()
    }

    async fn redeem_invite(
        &self,
        code: &str,
        user_id: &UserId,
        welcome_units: i64,
    ) -> Result<Redemption> {
        non_negative(welcome_units)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query(
            r"
            UPDATE invite_codes
            SET active = FALSE, used_by = $2, used_at = NOW()
            WHERE code = $1 AND active = TRUE
            RETURNING code, active, used_by, used_at, created_at
            ",
        )
        .bind(code)
        .bind(*user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("redeem_invite", e))?;

        let Some(row) = row else {
            let exists: Option<bool> =
                sqlx::query_scalar("SELECT active FROM invite_codes WHERE code = $1")
                    .bind(code)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("redeem_invite_classify", e))?;
            return Err(match exists {
                Some(_) => StoreError::InviteAlreadyUsed {
                    code: code.to_string(),
                },
                None => StoreError::not_found("invite", code),
            });
        };
        let invite = invite_from_row(&row)?;

        sqlx::query(
            "INSERT INTO user_balances (user_id, spendable_units) VALUES ($1, 0) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(*user_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("redeem_invite_balance", e))?;

        let (transaction, balance) = if welcome_units > 0 {
            let balance_after = increment(&mut tx, user_id, welcome_units).await?;
            let credit = Transaction::credit(*user_id, welcome_units, format!("invite:{code}"), None)?
                .with_balance_after(balance_after);
            insert_transaction(&mut tx, &credit).await?;
            (Some(credit), balance_after)
        } else {
            let current: i64 =
                sqlx::query_scalar("SELECT spendable_units FROM user_balances WHERE user_id = $1")
                    .bind(*user_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("redeem_invite_read", e))?;
            (None, current)
        };
        propagate_to_mirror(&mut tx, user_id, balance).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Redemption {
            invite,
            transaction,
            balance,
        })
    }
}
