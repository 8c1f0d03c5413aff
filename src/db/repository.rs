//! Repository layer (spec §4.2): thin wrappers over `PgPool` exposing the
//! three primitives every state machine in this crate is built on top of —
//! `create_if_not_exists`, `advance_status_if_current` (CAS on a status
//! column), and `claim_one_pending` (`SELECT ... FOR UPDATE SKIP LOCKED`
//! + advance to `processing`, atomic). Everything above this layer
//! (commitment pipeline, withdraw orchestrator, tx queue, polling
//! reconciler) is built only out of these three operations plus plain
//! reads, so race-free transitions are guaranteed in one place instead of
//! re-derived per caller.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::chain::address::UniversalAddress;
use crate::error::DomainError;

use super::models::*;

#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------
// Checkbooks
// ---------------------------------------------------------------------

impl Repository {
    /// Idempotent insert keyed on `(slip44_chain_id, local_deposit_id)`.
    /// Returns the existing row untouched when the key already exists —
    /// this is what makes re-delivered deposit events safe to ingest twice.
    pub async fn create_checkbook_if_not_exists(
        &self,
        new: &Checkbook,
    ) -> Result<Checkbook, DomainError> {
        let row = sqlx::query(
            r#"
            insert into checkbooks
                (id, slip44_chain_id, local_deposit_id, owner_chain_id, owner_data,
                 token_key, gross_amount, allocatable_amount, fee_total_locked,
                 commitment, status, created_at, updated_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now(), now())
            on conflict (slip44_chain_id, local_deposit_id) do nothing
            returning id
            "#,
        )
        .bind(new.id)
        .bind(new.slip44_chain_id as i64)
        .bind(&new.local_deposit_id)
        .bind(new.owner.chain_id as i64)
        .bind(&new.owner.data[..])
        .bind(&new.token_key)
        .bind(new.gross_amount.0)
        .bind(new.allocatable_amount.0)
        .bind(new.fee_total_locked.0)
        .bind(new.commitment.map(|c| c.to_vec()))
        .bind(status_str(new.status))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(_) => Ok(new.clone()),
            None => self
                .find_checkbook_by_deposit(new.slip44_chain_id, &new.local_deposit_id)
                .await?
                .ok_or_else(|| DomainError::Fatal("insert-or-fetch race on checkbooks".into())),
        }
    }

    pub async fn find_checkbook_by_deposit(
        &self,
        slip44_chain_id: u32,
        local_deposit_id: &str,
    ) -> Result<Option<Checkbook>, DomainError> {
        let row = sqlx::query(
            "select * from checkbooks where slip44_chain_id = $1 and local_deposit_id = $2",
        )
        .bind(slip44_chain_id as i64)
        .bind(local_deposit_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| checkbook_from_row(&r)).transpose()
    }

    /// Resolves `CommitmentRootUpdated` (spec §4.4), which carries the
    /// commitment value but not `local_deposit_id`, back to the checkbook
    /// `set_checkbook_commitment` stored it on.
    pub async fn find_checkbook_by_commitment(
        &self,
        slip44_chain_id: u32,
        commitment: [u8; 32],
    ) -> Result<Option<Checkbook>, DomainError> {
        let row = sqlx::query(
            "select * from checkbooks where slip44_chain_id = $1 and commitment = $2",
        )
        .bind(slip44_chain_id as i64)
        .bind(&commitment[..])
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| checkbook_from_row(&r)).transpose()
    }

    pub async fn get_checkbook(&self, id: Uuid) -> Result<Checkbook, DomainError> {
        let row = sqlx::query("select * from checkbooks where id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        checkbook_from_row(&row)
    }

    /// CAS: moves `status` from `expected` to `next` only if it still reads
    /// `expected`. Returns `Conflict` (not an error to the caller's caller)
    /// when another worker already moved it.
    pub async fn advance_checkbook_status_if_current(
        &self,
        id: Uuid,
        expected: CheckbookStatus,
        next: CheckbookStatus,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            "update checkbooks set status = $1, updated_at = now() where id = $2 and status = $3",
        )
        .bind(status_str(next))
        .bind(id)
        .bind(status_str(expected))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(format!(
                "checkbook {id} status was not {expected:?}"
            )));
        }
        Ok(())
    }

    /// Stores the prover's commitment once proof generation succeeds
    /// (spec §4.4: "the backend ... stores the commitment on the checkbook").
    pub async fn set_checkbook_commitment(&self, id: Uuid, commitment: [u8; 32]) -> Result<(), DomainError> {
        sqlx::query("update checkbooks set commitment = $1, updated_at = now() where id = $2")
            .bind(&commitment[..])
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------

impl Repository {
    pub async fn insert_allocations(
        &self,
        allocations: &[Allocation],
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await?;
        for a in allocations {
            sqlx::query(
                r#"
                insert into allocations (id, checkbook_id, seq, amount, status, nullifier, withdraw_request_id)
                values ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(a.id)
            .bind(a.checkbook_id)
            .bind(a.seq as i16)
            .bind(a.amount.0)
            .bind(allocation_status_str(a.status))
            .bind(a.nullifier.map(|n| n.to_vec()))
            .bind(a.withdraw_request_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_allocations_for_checkbook(
        &self,
        checkbook_id: Uuid,
    ) -> Result<Vec<Allocation>, DomainError> {
        let rows = sqlx::query("select * from allocations where checkbook_id = $1 order by seq")
            .bind(checkbook_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    pub async fn get_allocations(&self, ids: &[Uuid]) -> Result<Vec<Allocation>, DomainError> {
        let rows = sqlx::query("select * from allocations where id = any($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    /// Cancellation's allocation side: `pending -> idle`, clearing
    /// `withdraw_request_id`. Idempotent — already-idle rows are left
    /// alone rather than erroring, since cancel may race a late confirm.
    pub async fn release_allocations(&self, ids: &[Uuid]) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            update allocations
            set status = 'idle', withdraw_request_id = null
            where id = any($1) and status = 'pending'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Execute success's allocation side: `pending -> used`, recording the
    /// nullifier the ZK circuit derived. Terminal and irreversible (spec §3).
    pub async fn mark_allocations_used(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await?;
        for (id, nullifier) in pairs {
            sqlx::query(
                r#"
                update allocations
                set status = 'used', nullifier = $1
                where id = $2 and status = 'pending'
                "#,
            )
            .bind(&nullifier[..])
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Commitment confirmation's allocation side: `pending -> idle`,
    /// recording each allocation's derived nullifier (spec §4.4: "each
    /// allocation's nullifier is derived and stored; allocations
    /// transition pending→idle"). Distinct from `mark_allocations_used`,
    /// which is the withdraw-side `pending -> used` terminal transition.
    pub async fn mark_allocations_idle_with_nullifiers(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await?;
        for (id, nullifier) in pairs {
            sqlx::query(
                r#"
                update allocations
                set status = 'idle', nullifier = $1
                where id = $2 and status = 'pending'
                "#,
            )
            .bind(&nullifier[..])
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Reserves idle allocations for a withdraw request by CAS-ing each
    /// `idle -> pending`. All-or-nothing: if any allocation has already
    /// moved, the whole reservation rolls back so a withdraw never spends
    /// a partial set.
    pub async fn reserve_allocations(
        &self,
        allocation_ids: &[Uuid],
        withdraw_request_id: Uuid,
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await?;
        for id in allocation_ids {
            let result = sqlx::query(
                r#"
                update allocations
                set status = 'pending', withdraw_request_id = $1
                where id = $2 and status = 'idle'
                "#,
            )
            .bind(withdraw_request_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(DomainError::Conflict(format!(
                    "allocation {id} is not idle"
                )));
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Withdraw requests
// ---------------------------------------------------------------------

impl Repository {
    pub async fn create_withdraw_request_if_not_exists(
        &self,
        new: &WithdrawRequest,
    ) -> Result<WithdrawRequest, DomainError> {
        let row = sqlx::query(
            r#"
            insert into withdraw_requests
                (id, owner_chain_id, owner_data, intent, amount, allocation_ids,
                 max_slippage_bps, min_output_amount, payout_deadline,
                 proof_status, execute_status, payout_status, hook_status,
                 created_at, updated_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now())
            on conflict (id) do nothing
            returning id
            "#,
        )
        .bind(new.id)
        .bind(new.owner.chain_id as i64)
        .bind(&new.owner.data[..])
        .bind(serde_json::to_value(&new.intent).map_err(|e| DomainError::Invalid(e.to_string()))?)
        .bind(new.amount.0)
        .bind(&new.allocation_ids)
        .bind(new.max_slippage_bps.map(|v| v as i64))
        .bind(new.min_output_amount.map(|v| v.0))
        .bind(new.payout_deadline)
        .bind(proof_status_str(new.proof_status))
        .bind(execute_status_str(new.execute_status))
        .bind(payout_status_str(new.payout_status))
        .bind(hook_status_str(new.hook_status))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(_) => Ok(new.clone()),
            None => self
                .get_withdraw_request(new.id)
                .await,
        }
    }

    pub async fn get_withdraw_request(&self, id: Uuid) -> Result<WithdrawRequest, DomainError> {
        let row = sqlx::query("select * from withdraw_requests where id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        withdraw_request_from_row(&row)
    }

    /// Correlates an on-chain `WithdrawRequested`/`WithdrawExecuted` event
    /// back to the request the proof stage already created: `withdraw_nullifier`
    /// (= nullifiers[0]) is set at `complete_proof` time and is unique per
    /// spec §3, so it's the only identifier the chain-side event carries
    /// that the backend can resolve against.
    pub async fn find_withdraw_request_by_nullifier(
        &self,
        nullifier: [u8; 32],
    ) -> Result<Option<WithdrawRequest>, DomainError> {
        let row = sqlx::query("select * from withdraw_requests where withdraw_nullifier = $1")
            .bind(&nullifier[..])
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| withdraw_request_from_row(&r)).transpose()
    }

    /// CAS on whichever sub-status column `field` names. Callers go through
    /// the typed wrappers below (`advance_proof_status_if_current`, etc.)
    /// rather than calling this directly.
    async fn advance_withdraw_column_if_current(
        &self,
        id: Uuid,
        column: &str,
        expected: &str,
        next: &str,
    ) -> Result<(), DomainError> {
        let sql = format!(
            "update withdraw_requests set {column} = $1, updated_at = now() where id = $2 and {column} = $3"
        );
        let result = sqlx::query(&sql)
            .bind(next)
            .bind(id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(format!(
                "withdraw_request {id} column {column} was not {expected}"
            )));
        }
        Ok(())
    }

    pub async fn advance_proof_status_if_current(
        &self,
        id: Uuid,
        expected: ProofStatus,
        next: ProofStatus,
    ) -> Result<(), DomainError> {
        self.advance_withdraw_column_if_current(
            id,
            "proof_status",
            proof_status_str(expected),
            proof_status_str(next),
        )
        .await
    }

    pub async fn advance_execute_status_if_current(
        &self,
        id: Uuid,
        expected: ExecuteStatus,
        next: ExecuteStatus,
    ) -> Result<(), DomainError> {
        self.advance_withdraw_column_if_current(
            id,
            "execute_status",
            execute_status_str(expected),
            execute_status_str(next),
        )
        .await
    }

    pub async fn advance_payout_status_if_current(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
    ) -> Result<(), DomainError> {
        self.advance_withdraw_column_if_current(
            id,
            "payout_status",
            payout_status_str(expected),
            payout_status_str(next),
        )
        .await
    }

    pub async fn advance_hook_status_if_current(
        &self,
        id: Uuid,
        expected: HookStatus,
        next: HookStatus,
    ) -> Result<(), DomainError> {
        self.advance_withdraw_column_if_current(
            id,
            "hook_status",
            hook_status_str(expected),
            hook_status_str(next),
        )
        .await
    }

    pub async fn mark_user_cancelled(&self, id: Uuid) -> Result<(), DomainError> {
        let result = sqlx::query(
            "update withdraw_requests set user_cancelled = true, updated_at = now() where id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(format!(
                "withdraw_request {id} not found"
            )));
        }
        Ok(())
    }

    /// Flexible partial update over `withdraw_requests`' optional fields.
    /// Every column uses `COALESCE($n, column)` so a `None` field leaves the
    /// existing value untouched — the orchestrator calls this once per stage
    /// transition to record tx hashes / errors, separately from the CAS call
    /// that actually advances the stage's status column.
    pub async fn set_withdraw_fields(
        &self,
        id: Uuid,
        update: &WithdrawFieldUpdate,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            r#"
            update withdraw_requests set
                withdraw_nullifier = coalesce($1, withdraw_nullifier),
                queue_root = coalesce($2, queue_root),
                execute_chain_id = coalesce($3, execute_chain_id),
                execute_tx_hash = coalesce($4, execute_tx_hash),
                payout_chain_id = coalesce($5, payout_chain_id),
                payout_tx_hash = coalesce($6, payout_tx_hash),
                payout_worker_type = coalesce($7, payout_worker_type),
                hook_chain_id = coalesce($8, hook_chain_id),
                hook_tx_hash = coalesce($9, hook_tx_hash),
                hook_intent_type = coalesce($10, hook_intent_type),
                hook_token_id = coalesce($11, hook_token_id),
                hook_worker_id = coalesce($12, hook_worker_id),
                hook_min_output_amount = coalesce($13, hook_min_output_amount),
                proof_error = coalesce($14, proof_error),
                execute_error = coalesce($15, execute_error),
                payout_error = coalesce($16, payout_error),
                hook_error = coalesce($17, hook_error),
                proof_retry_count = coalesce($18, proof_retry_count),
                execute_retry_count = coalesce($19, execute_retry_count),
                fallback_transferred = coalesce($20, fallback_transferred),
                updated_at = now()
            where id = $21
            "#,
        )
        .bind(update.withdraw_nullifier.map(|b| b.to_vec()))
        .bind(update.queue_root.map(|b| b.to_vec()))
        .bind(update.execute_chain_id.map(|v| v as i64))
        .bind(&update.execute_tx_hash)
        .bind(update.payout_chain_id.map(|v| v as i64))
        .bind(&update.payout_tx_hash)
        .bind(update.payout_worker_type.map(|t| t as i16))
        .bind(update.hook_chain_id.map(|v| v as i64))
        .bind(&update.hook_tx_hash)
        .bind(&update.hook_intent_type)
        .bind(&update.hook_token_id)
        .bind(&update.hook_worker_id)
        .bind(update.hook_min_output_amount.map(|w| w.0))
        .bind(&update.proof_error)
        .bind(&update.execute_error)
        .bind(&update.payout_error)
        .bind(&update.hook_error)
        .bind(update.proof_retry_count.map(|v| v as i32))
        .bind(update.execute_retry_count.map(|v| v as i32))
        .bind(update.fallback_transferred)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(format!(
                "withdraw_request {id} not found"
            )));
        }
        Ok(())
    }

    pub async fn record_payout_retry(&self, record: &PayoutRetryRecord) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into payout_retry_records
                (id, withdraw_request_id, chain_id, attempt, reason, recorded_at)
            values ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(record.id)
        .bind(record.withdraw_request_id)
        .bind(record.chain_id as i64)
        .bind(record.attempt as i32)
        .bind(&record.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_fallback_retry(
        &self,
        record: &FallbackRetryRecord,
    ) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into fallback_retry_records
                (id, withdraw_request_id, chain_id, attempt, reason, recorded_at)
            values ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(record.id)
        .bind(record.withdraw_request_id)
        .bind(record.chain_id as i64)
        .bind(record.attempt as i32)
        .bind(&record.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Partial-update DTO for [`Repository::set_withdraw_fields`]. Every field
/// left `None` is left untouched in the row.
#[derive(Debug, Clone, Default)]
pub struct WithdrawFieldUpdate {
    pub withdraw_nullifier: Option<[u8; 32]>,
    pub queue_root: Option<[u8; 32]>,
    pub execute_chain_id: Option<u32>,
    pub execute_tx_hash: Option<String>,
    pub payout_chain_id: Option<u32>,
    pub payout_tx_hash: Option<String>,
    pub payout_worker_type: Option<PayoutWorkerType>,
    pub hook_chain_id: Option<u32>,
    pub hook_tx_hash: Option<String>,
    pub hook_intent_type: Option<String>,
    pub hook_token_id: Option<String>,
    pub hook_worker_id: Option<String>,
    pub hook_min_output_amount: Option<Wei>,
    pub proof_error: Option<String>,
    pub execute_error: Option<String>,
    pub payout_error: Option<String>,
    pub hook_error: Option<String>,
    pub proof_retry_count: Option<u32>,
    pub execute_retry_count: Option<u32>,
    pub fallback_transferred: Option<bool>,
}

// ---------------------------------------------------------------------
// Task insertion (enqueue side; claim side is below)
// ---------------------------------------------------------------------

impl Repository {
    pub async fn insert_proof_generation_task(&self, task: &ProofGenerationTask) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into proof_generation_tasks
                (id, status, retry_count, max_retries, next_retry_at, priority, task_data, submission_context, last_error, created_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            "#,
        )
        .bind(task.id)
        .bind(task_status_str(task.status))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.next_retry_at)
        .bind(task.priority)
        .bind(serde_json::to_value(&task.task_data).map_err(|e| DomainError::Fatal(e.to_string()))?)
        .bind(&task.submission_context)
        .bind(&task.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_withdraw_proof_generation_task(
        &self,
        task: &WithdrawProofGenerationTask,
    ) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into withdraw_proof_generation_tasks
                (id, status, retry_count, max_retries, next_retry_at, priority, task_data, submission_context, last_error, created_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            "#,
        )
        .bind(task.id)
        .bind(task_status_str(task.status))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.next_retry_at)
        .bind(task.priority)
        .bind(serde_json::to_value(&task.task_data).map_err(|e| DomainError::Fatal(e.to_string()))?)
        .bind(&task.submission_context)
        .bind(&task.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into pending_transactions
                (id, status, retry_count, max_retries, next_retry_at, priority, task_data, submission_context, last_error, created_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            "#,
        )
        .bind(tx.id)
        .bind(task_status_str(tx.status))
        .bind(tx.retry_count as i32)
        .bind(tx.max_retries as i32)
        .bind(tx.next_retry_at)
        .bind(tx.priority)
        .bind(serde_json::to_value(&tx.task_data).map_err(|e| DomainError::Fatal(e.to_string()))?)
        .bind(&tx.submission_context)
        .bind(&tx.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_polling_task(&self, task: &PollingTask) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into polling_tasks
                (id, status, retry_count, max_retries, next_poll_at, poll_interval_secs, data, last_error)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(task.id)
        .bind(task_status_str(task.status))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.next_poll_at)
        .bind(task.poll_interval_secs as i64)
        .bind(serde_json::to_value(&task.data).map_err(|e| DomainError::Fatal(e.to_string()))?)
        .bind(&task.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Generic claim-one-pending over a task table
// ---------------------------------------------------------------------

impl Repository {
    /// `SELECT ... FOR UPDATE SKIP LOCKED` the oldest due row in `table`
    /// ordered by `(priority, created_at)`, then advances it to
    /// `processing` within the same transaction and commits. Returns
    /// `None` when no row is due. Completion (`complete_proof_task` /
    /// `fail_proof_task`, etc.) is a separate CAS call from `processing`,
    /// which is race-free since only the claimant holds that status.
    pub async fn claim_one_pending_proof_task(
        &self,
    ) -> Result<Option<ProofGenerationTask>, DomainError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            select * from proof_generation_tasks
            where status = 'pending' and (next_retry_at is null or next_retry_at <= now())
            order by priority asc, created_at asc
            limit 1
            for update skip locked
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("update proof_generation_tasks set status = 'processing' where id = $1")
            .bind(row.try_get::<Uuid, _>("id")?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(proof_generation_task_from_row(&row)?))
    }

    pub async fn claim_one_pending_withdraw_proof_task(
        &self,
    ) -> Result<Option<WithdrawProofGenerationTask>, DomainError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            select * from withdraw_proof_generation_tasks
            where status = 'pending' and (next_retry_at is null or next_retry_at <= now())
            order by priority asc, created_at asc
            limit 1
            for update skip locked
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("update withdraw_proof_generation_tasks set status = 'processing' where id = $1")
            .bind(row.try_get::<Uuid, _>("id")?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(withdraw_proof_generation_task_from_row(&row)?))
    }

    /// Claims the next due pending transaction for `sender/chain`, ordered
    /// by priority then nonce assignment, within a single nonce/chain lane
    /// (spec §4.6: one in-flight tx per sender/chain at a time).
    pub async fn claim_one_pending_transaction(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<PendingTransaction>, DomainError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            select * from pending_transactions
            where status = 'pending' and sender_address = $1 and chain_id = $2
              and (next_retry_at is null or next_retry_at <= now())
            order by priority asc, created_at asc
            limit 1
            for update skip locked
            "#,
        )
        .bind(sender_address)
        .bind(chain_id as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("update pending_transactions set status = 'processing' where id = $1")
            .bind(row.try_get::<Uuid, _>("id")?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(pending_transaction_from_row(&row)?))
    }

    /// Highest nonce already assigned to an in-flight (`processing` or
    /// `submitted`) transaction on this sender/chain lane. `txqueue::nonce`
    /// combines this with the chain's own nonce to pick the next one.
    pub async fn highest_assigned_nonce(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<u64>, DomainError> {
        let row = sqlx::query(
            r#"
            select max((task_data->>'assigned_nonce')::bigint) as max_nonce
            from pending_transactions
            where task_data->>'sender_address' = $1
              and (task_data->>'chain_id')::bigint = $2
              and status in ('processing', 'submitted')
            "#,
        )
        .bind(sender_address)
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;
        let max_nonce: Option<i64> = row.try_get("max_nonce")?;
        Ok(max_nonce.map(|n| n as u64))
    }

    /// Records the nonce the queue assigned and the hash the sender
    /// returned, moving the row from `processing` to `submitted`.
    pub async fn mark_transaction_submitted(
        &self,
        id: Uuid,
        nonce: u64,
        tx_hash: &str,
    ) -> Result<(), DomainError> {
        let rows = sqlx::query(
            r#"
            update pending_transactions
            set status = 'submitted',
                task_data = jsonb_set(task_data, '{assigned_nonce}', to_jsonb($1::bigint)),
                submission_context = $2
            where id = $3 and status = 'processing'
            "#,
        )
        .bind(nonce as i64)
        .bind(serde_json::json!({ "tx_hash": tx_hash }))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if rows.rows_affected() == 0 {
            return Err(DomainError::Conflict("transaction not in processing".into()));
        }
        Ok(())
    }

    /// Bumps `gas_bump_count` and overwrites the submission hash after a
    /// rebroadcast at the same nonce with higher gas.
    pub async fn record_gas_bump(&self, id: Uuid, tx_hash: &str) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            update pending_transactions
            set task_data = jsonb_set(
                    task_data,
                    '{gas_bump_count}',
                    to_jsonb(coalesce((task_data->>'gas_bump_count')::int, 0) + 1)
                ),
                submission_context = $1
            where id = $2
            "#,
        )
        .bind(serde_json::json!({ "tx_hash": tx_hash }))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All lanes' in-flight submissions, for the confirmation sweep
    /// (spec §4.6 step 4). Unlike `claim_one_pending_transaction` this is a
    /// plain read: checking a receipt needs no row lock, only the eventual
    /// `complete_task`/`fail_task` call does.
    pub async fn list_submitted_transactions(&self) -> Result<Vec<PendingTransaction>, DomainError> {
        let rows = sqlx::query("select * from pending_transactions where status = 'submitted'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(pending_transaction_from_row).collect()
    }

    pub async fn claim_one_due_polling_task(&self) -> Result<Option<PollingTask>, DomainError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            select * from polling_tasks
            where status = 'pending' and next_poll_at <= now()
            order by next_poll_at asc
            limit 1
            for update skip locked
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("update polling_tasks set status = 'processing' where id = $1")
            .bind(row.try_get::<Uuid, _>("id")?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(polling_task_from_row(&row)?))
    }

    /// Polling tasks reschedule on their own `next_poll_at`/`poll_interval_secs`
    /// columns rather than `next_retry_at`, so they use their own
    /// completion methods instead of `complete_task`/`fail_task`.
    pub async fn complete_polling_task(&self, id: Uuid) -> Result<(), DomainError> {
        sqlx::query("update polling_tasks set status = 'completed' where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The scanner/chain check didn't yet confirm the expected fact: bump
    /// the retry counter and requeue `poll_interval_secs` out, or mark
    /// `failed` once `max_retries` is reached (spec §4.8, default 180 × 10s).
    pub async fn reschedule_or_fail_polling_task(
        &self,
        task: &PollingTask,
        error: &str,
    ) -> Result<(), DomainError> {
        if task.retry_count + 1 >= task.max_retries {
            sqlx::query("update polling_tasks set status = 'failed', last_error = $1, retry_count = retry_count + 1 where id = $2")
                .bind(error)
                .bind(task.id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        let next_poll_at = chrono::Utc::now() + chrono::Duration::seconds(task.poll_interval_secs as i64);
        sqlx::query(
            "update polling_tasks set status = 'pending', last_error = $1, retry_count = retry_count + 1, next_poll_at = $2 where id = $3",
        )
        .bind(error)
        .bind(next_poll_at)
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a `processing` task row `completed`, or `failed`/requeued with
    /// a backoff timestamp when `next_retry_at` is `Some`. Used after
    /// `claim_one_pending_*` regardless of which task table the row came
    /// from.
    pub async fn complete_task(&self, table: &str, id: Uuid) -> Result<(), DomainError> {
        self.set_task_outcome(table, id, "completed", None, None).await
    }

    pub async fn fail_task(
        &self,
        table: &str,
        id: Uuid,
        error: &str,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DomainError> {
        let status = if next_retry_at.is_some() { "pending" } else { "failed" };
        self.set_task_outcome(table, id, status, Some(error), next_retry_at)
            .await
    }

    async fn set_task_outcome(
        &self,
        table: &str,
        id: Uuid,
        status: &str,
        error: Option<&str>,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DomainError> {
        let allowed = [
            "proof_generation_tasks",
            "withdraw_proof_generation_tasks",
            "pending_transactions",
            "polling_tasks",
        ];
        if !allowed.contains(&table) {
            return Err(DomainError::Fatal(format!("unknown task table {table}")));
        }
        let sql = format!(
            "update {table} set status = $1, last_error = $2, next_retry_at = $3, \
             retry_count = retry_count + (case when $2 is not null then 1 else 0 end) where id = $4"
        );
        sqlx::query(&sql)
            .bind(status)
            .bind(error)
            .bind(next_retry_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// On startup, any row stuck in `processing` belonged to a worker that
    /// crashed mid-task (spec §4.7 recovery rule). Resets it to `pending` so
    /// the next claim picks it up again.
    pub async fn recover_stuck_processing_rows(&self, table: &str) -> Result<u64, DomainError> {
        let allowed = [
            "proof_generation_tasks",
            "withdraw_proof_generation_tasks",
            "pending_transactions",
            "polling_tasks",
        ];
        if !allowed.contains(&table) {
            return Err(DomainError::Fatal(format!("unknown task table {table}")));
        }
        let sql = format!("update {table} set status = 'pending' where status = 'processing'");
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------
// Event log (idempotency for ingested events, spec §4.3)
// ---------------------------------------------------------------------

impl Repository {
    /// Inserts the event row iff `(chain_id, transaction_hash, log_index)`
    /// hasn't been seen. Returns `true` if this call performed the insert,
    /// `false` if it was a duplicate delivery.
    pub async fn record_event_if_new(&self, row: &EventLogRow) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r#"
            insert into event_log
                (id, chain_id, transaction_hash, log_index, event_name, block_number, payload, received_at)
            values ($1, $2, $3, $4, $5, $6, $7, now())
            on conflict (chain_id, transaction_hash, log_index) do nothing
            "#,
        )
        .bind(row.id)
        .bind(row.chain_id as i64)
        .bind(&row.transaction_hash)
        .bind(row.log_index as i64)
        .bind(&row.event_name)
        .bind(row.block_number as i64)
        .bind(&row.payload)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------
// Subgraph catch-up cursors (spec §4.3)
// ---------------------------------------------------------------------

impl Repository {
    pub async fn get_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
    ) -> Result<Option<SubgraphCursor>, DomainError> {
        let row = sqlx::query("select * from subgraph_cursors where chain_id = $1 and subgraph_url = $2")
            .bind(chain_id as i64)
            .bind(subgraph_url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| subgraph_cursor_from_row(&r)).transpose()
    }

    /// Upserts the cursor, never moving it backwards — a catch-up run that
    /// raced a fresher one must not regress the cursor it already set.
    pub async fn advance_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
        last_synced_block: u64,
    ) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            insert into subgraph_cursors (chain_id, subgraph_url, last_synced_block)
            values ($1, $2, $3)
            on conflict (chain_id, subgraph_url) do update
            set last_synced_block = excluded.last_synced_block
            where subgraph_cursors.last_synced_block < excluded.last_synced_block
            "#,
        )
        .bind(chain_id as i64)
        .bind(subgraph_url)
        .bind(last_synced_block as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// RepositoryPort: the same surface as object-safe trait, so orchestrator
// code can run against `Repository` in production and an in-memory double
// (see `db::test_support`) in tests without a live Postgres instance.
// ---------------------------------------------------------------------

#[async_trait::async_trait]
pub trait RepositoryPort: Send + Sync {
    /// Cheap connectivity check for `/readyz`.
    async fn ping(&self) -> Result<(), DomainError>;
    async fn create_checkbook_if_not_exists(&self, new: &Checkbook) -> Result<Checkbook, DomainError>;
    async fn find_checkbook_by_deposit(
        &self,
        slip44_chain_id: u32,
        local_deposit_id: &str,
    ) -> Result<Option<Checkbook>, DomainError>;
    async fn find_checkbook_by_commitment(
        &self,
        slip44_chain_id: u32,
        commitment: [u8; 32],
    ) -> Result<Option<Checkbook>, DomainError>;
    async fn get_checkbook(&self, id: Uuid) -> Result<Checkbook, DomainError>;
    async fn advance_checkbook_status_if_current(
        &self,
        id: Uuid,
        expected: CheckbookStatus,
        next: CheckbookStatus,
    ) -> Result<(), DomainError>;
    async fn set_checkbook_commitment(&self, id: Uuid, commitment: [u8; 32]) -> Result<(), DomainError>;

    async fn insert_allocations(&self, allocations: &[Allocation]) -> Result<(), DomainError>;
    async fn list_allocations_for_checkbook(&self, checkbook_id: Uuid) -> Result<Vec<Allocation>, DomainError>;
    async fn get_allocations(&self, ids: &[Uuid]) -> Result<Vec<Allocation>, DomainError>;
    async fn release_allocations(&self, ids: &[Uuid]) -> Result<(), DomainError>;
    async fn mark_allocations_used(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError>;
    async fn mark_allocations_idle_with_nullifiers(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError>;
    async fn reserve_allocations(
        &self,
        allocation_ids: &[Uuid],
        withdraw_request_id: Uuid,
    ) -> Result<(), DomainError>;

    async fn create_withdraw_request_if_not_exists(
        &self,
        new: &WithdrawRequest,
    ) -> Result<WithdrawRequest, DomainError>;
    async fn get_withdraw_request(&self, id: Uuid) -> Result<WithdrawRequest, DomainError>;
    async fn find_withdraw_request_by_nullifier(
        &self,
        nullifier: [u8; 32],
    ) -> Result<Option<WithdrawRequest>, DomainError>;
    async fn advance_proof_status_if_current(
        &self,
        id: Uuid,
        expected: ProofStatus,
        next: ProofStatus,
    ) -> Result<(), DomainError>;
    async fn advance_execute_status_if_current(
        &self,
        id: Uuid,
        expected: ExecuteStatus,
        next: ExecuteStatus,
    ) -> Result<(), DomainError>;
    async fn advance_payout_status_if_current(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
    ) -> Result<(), DomainError>;
    async fn advance_hook_status_if_current(
        &self,
        id: Uuid,
        expected: HookStatus,
        next: HookStatus,
    ) -> Result<(), DomainError>;
    async fn mark_user_cancelled(&self, id: Uuid) -> Result<(), DomainError>;
    async fn set_withdraw_fields(&self, id: Uuid, update: &WithdrawFieldUpdate) -> Result<(), DomainError>;
    async fn record_payout_retry(&self, record: &PayoutRetryRecord) -> Result<(), DomainError>;
    async fn record_fallback_retry(&self, record: &FallbackRetryRecord) -> Result<(), DomainError>;

    async fn claim_one_pending_proof_task(&self) -> Result<Option<ProofGenerationTask>, DomainError>;
    async fn claim_one_pending_withdraw_proof_task(
        &self,
    ) -> Result<Option<WithdrawProofGenerationTask>, DomainError>;
    async fn claim_one_pending_transaction(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<PendingTransaction>, DomainError>;
    async fn claim_one_due_polling_task(&self) -> Result<Option<PollingTask>, DomainError>;
    async fn complete_polling_task(&self, id: Uuid) -> Result<(), DomainError>;
    async fn reschedule_or_fail_polling_task(&self, task: &PollingTask, error: &str) -> Result<(), DomainError>;
    async fn list_submitted_transactions(&self) -> Result<Vec<PendingTransaction>, DomainError>;
    async fn highest_assigned_nonce(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<u64>, DomainError>;
    async fn mark_transaction_submitted(
        &self,
        id: Uuid,
        nonce: u64,
        tx_hash: &str,
    ) -> Result<(), DomainError>;
    async fn record_gas_bump(&self, id: Uuid, tx_hash: &str) -> Result<(), DomainError>;
    async fn complete_task(&self, table: &str, id: Uuid) -> Result<(), DomainError>;
    async fn fail_task(
        &self,
        table: &str,
        id: Uuid,
        error: &str,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DomainError>;
    async fn recover_stuck_processing_rows(&self, table: &str) -> Result<u64, DomainError>;

    async fn insert_proof_generation_task(&self, task: &ProofGenerationTask) -> Result<(), DomainError>;
    async fn insert_withdraw_proof_generation_task(
        &self,
        task: &WithdrawProofGenerationTask,
    ) -> Result<(), DomainError>;
    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> Result<(), DomainError>;
    async fn insert_polling_task(&self, task: &PollingTask) -> Result<(), DomainError>;

    async fn record_event_if_new(&self, row: &EventLogRow) -> Result<bool, DomainError>;

    async fn get_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
    ) -> Result<Option<SubgraphCursor>, DomainError>;
    async fn advance_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
        last_synced_block: u64,
    ) -> Result<(), DomainError>;
}

#[async_trait::async_trait]
impl RepositoryPort for Repository {
    async fn ping(&self) -> Result<(), DomainError> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_checkbook_if_not_exists(&self, new: &Checkbook) -> Result<Checkbook, DomainError> {
        Repository::create_checkbook_if_not_exists(self, new).await
    }
    async fn find_checkbook_by_deposit(
        &self,
        slip44_chain_id: u32,
        local_deposit_id: &str,
    ) -> Result<Option<Checkbook>, DomainError> {
        Repository::find_checkbook_by_deposit(self, slip44_chain_id, local_deposit_id).await
    }
    async fn find_checkbook_by_commitment(
        &self,
        slip44_chain_id: u32,
        commitment: [u8; 32],
    ) -> Result<Option<Checkbook>, DomainError> {
        Repository::find_checkbook_by_commitment(self, slip44_chain_id, commitment).await
    }
    async fn get_checkbook(&self, id: Uuid) -> Result<Checkbook, DomainError> {
        Repository::get_checkbook(self, id).await
    }
    async fn advance_checkbook_status_if_current(
        &self,
        id: Uuid,
        expected: CheckbookStatus,
        next: CheckbookStatus,
    ) -> Result<(), DomainError> {
        Repository::advance_checkbook_status_if_current(self, id, expected, next).await
    }
    async fn set_checkbook_commitment(&self, id: Uuid, commitment: [u8; 32]) -> Result<(), DomainError> {
        Repository::set_checkbook_commitment(self, id, commitment).await
    }
    async fn insert_allocations(&self, allocations: &[Allocation]) -> Result<(), DomainError> {
        Repository::insert_allocations(self, allocations).await
    }
    async fn list_allocations_for_checkbook(&self, checkbook_id: Uuid) -> Result<Vec<Allocation>, DomainError> {
        Repository::list_allocations_for_checkbook(self, checkbook_id).await
    }
    async fn get_allocations(&self, ids: &[Uuid]) -> Result<Vec<Allocation>, DomainError> {
        Repository::get_allocations(self, ids).await
    }
    async fn release_allocations(&self, ids: &[Uuid]) -> Result<(), DomainError> {
        Repository::release_allocations(self, ids).await
    }
    async fn mark_allocations_used(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        Repository::mark_allocations_used(self, pairs).await
    }
    async fn mark_allocations_idle_with_nullifiers(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        Repository::mark_allocations_idle_with_nullifiers(self, pairs).await
    }
    async fn reserve_allocations(
        &self,
        allocation_ids: &[Uuid],
        withdraw_request_id: Uuid,
    ) -> Result<(), DomainError> {
        Repository::reserve_allocations(self, allocation_ids, withdraw_request_id).await
    }
    async fn create_withdraw_request_if_not_exists(
        &self,
        new: &WithdrawRequest,
    ) -> Result<WithdrawRequest, DomainError> {
        Repository::create_withdraw_request_if_not_exists(self, new).await
    }
    async fn get_withdraw_request(&self, id: Uuid) -> Result<WithdrawRequest, DomainError> {
        Repository::get_withdraw_request(self, id).await
    }
    async fn find_withdraw_request_by_nullifier(
        &self,
        nullifier: [u8; 32],
    ) -> Result<Option<WithdrawRequest>, DomainError> {
        Repository::find_withdraw_request_by_nullifier(self, nullifier).await
    }
    async fn advance_proof_status_if_current(
        &self,
        id: Uuid,
        expected: ProofStatus,
        next: ProofStatus,
    ) -> Result<(), DomainError> {
        Repository::advance_proof_status_if_current(self, id, expected, next).await
    }
    async fn advance_execute_status_if_current(
        &self,
        id: Uuid,
        expected: ExecuteStatus,
        next: ExecuteStatus,
    ) -> Result<(), DomainError> {
        Repository::advance_execute_status_if_current(self, id, expected, next).await
    }
    async fn advance_payout_status_if_current(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
    ) -> Result<(), DomainError> {
        Repository::advance_payout_status_if_current(self, id, expected, next).await
    }
    async fn advance_hook_status_if_current(
        &self,
        id: Uuid,
        expected: HookStatus,
        next: HookStatus,
    ) -> Result<(), DomainError> {
        Repository::advance_hook_status_if_current(self, id, expected, next).await
    }
    async fn mark_user_cancelled(&self, id: Uuid) -> Result<(), DomainError> {
        Repository::mark_user_cancelled(self, id).await
    }
    async fn set_withdraw_fields(&self, id: Uuid, update: &WithdrawFieldUpdate) -> Result<(), DomainError> {
        Repository::set_withdraw_fields(self, id, update).await
    }
    async fn record_payout_retry(&self, record: &PayoutRetryRecord) -> Result<(), DomainError> {
        Repository::record_payout_retry(self, record).await
    }
    async fn record_fallback_retry(&self, record: &FallbackRetryRecord) -> Result<(), DomainError> {
        Repository::record_fallback_retry(self, record).await
    }
    async fn claim_one_pending_proof_task(&self) -> Result<Option<ProofGenerationTask>, DomainError> {
        Repository::claim_one_pending_proof_task(self).await
    }
    async fn claim_one_pending_withdraw_proof_task(
        &self,
    ) -> Result<Option<WithdrawProofGenerationTask>, DomainError> {
        Repository::claim_one_pending_withdraw_proof_task(self).await
    }
    async fn claim_one_pending_transaction(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<PendingTransaction>, DomainError> {
        Repository::claim_one_pending_transaction(self, sender_address, chain_id).await
    }
    async fn claim_one_due_polling_task(&self) -> Result<Option<PollingTask>, DomainError> {
        Repository::claim_one_due_polling_task(self).await
    }
    async fn complete_polling_task(&self, id: Uuid) -> Result<(), DomainError> {
        Repository::complete_polling_task(self, id).await
    }
    async fn reschedule_or_fail_polling_task(&self, task: &PollingTask, error: &str) -> Result<(), DomainError> {
        Repository::reschedule_or_fail_polling_task(self, task, error).await
    }
    async fn list_submitted_transactions(&self) -> Result<Vec<PendingTransaction>, DomainError> {
        Repository::list_submitted_transactions(self).await
    }
    async fn highest_assigned_nonce(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<u64>, DomainError> {
        Repository::highest_assigned_nonce(self, sender_address, chain_id).await
    }
    async fn mark_transaction_submitted(
        &self,
        id: Uuid,
        nonce: u64,
        tx_hash: &str,
    ) -> Result<(), DomainError> {
        Repository::mark_transaction_submitted(self, id, nonce, tx_hash).await
    }
    async fn record_gas_bump(&self, id: Uuid, tx_hash: &str) -> Result<(), DomainError> {
        Repository::record_gas_bump(self, id, tx_hash).await
    }
    async fn complete_task(&self, table: &str, id: Uuid) -> Result<(), DomainError> {
        Repository::complete_task(self, table, id).await
    }
    async fn fail_task(
        &self,
        table: &str,
        id: Uuid,
        error: &str,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DomainError> {
        Repository::fail_task(self, table, id, error, next_retry_at).await
    }
    async fn recover_stuck_processing_rows(&self, table: &str) -> Result<u64, DomainError> {
        Repository::recover_stuck_processing_rows(self, table).await
    }
    async fn insert_proof_generation_task(&self, task: &ProofGenerationTask) -> Result<(), DomainError> {
        Repository::insert_proof_generation_task(self, task).await
    }
    async fn insert_withdraw_proof_generation_task(
        &self,
        task: &WithdrawProofGenerationTask,
    ) -> Result<(), DomainError> {
        Repository::insert_withdraw_proof_generation_task(self, task).await
    }
    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> Result<(), DomainError> {
        Repository::insert_pending_transaction(self, tx).await
    }
    async fn insert_polling_task(&self, task: &PollingTask) -> Result<(), DomainError> {
        Repository::insert_polling_task(self, task).await
    }
    async fn record_event_if_new(&self, row: &EventLogRow) -> Result<bool, DomainError> {
        Repository::record_event_if_new(self, row).await
    }
    async fn get_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
    ) -> Result<Option<SubgraphCursor>, DomainError> {
        Repository::get_subgraph_cursor(self, chain_id, subgraph_url).await
    }
    async fn advance_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
        last_synced_block: u64,
    ) -> Result<(), DomainError> {
        Repository::advance_subgraph_cursor(self, chain_id, subgraph_url, last_synced_block).await
    }
}

// ---------------------------------------------------------------------
// Row <-> model mapping helpers
// ---------------------------------------------------------------------

fn status_str(s: CheckbookStatus) -> &'static str {
    match s {
        CheckbookStatus::Pending => "pending",
        CheckbookStatus::Unsigned => "unsigned",
        CheckbookStatus::ReadyForCommitment => "ready_for_commitment",
        CheckbookStatus::GeneratingProof => "generating_proof",
        CheckbookStatus::SubmittingCommitment => "submitting_commitment",
        CheckbookStatus::CommitmentPending => "commitment_pending",
        CheckbookStatus::WithCheckbook => "with_checkbook",
        CheckbookStatus::ProofFailed => "proof_failed",
        CheckbookStatus::SubmissionFailed => "submission_failed",
        CheckbookStatus::Deleted => "deleted",
    }
}

fn status_from_str(s: &str) -> Result<CheckbookStatus, DomainError> {
    Ok(match s {
        "pending" => CheckbookStatus::Pending,
        "unsigned" => CheckbookStatus::Unsigned,
        "ready_for_commitment" => CheckbookStatus::ReadyForCommitment,
        "generating_proof" => CheckbookStatus::GeneratingProof,
        "submitting_commitment" => CheckbookStatus::SubmittingCommitment,
        "commitment_pending" => CheckbookStatus::CommitmentPending,
        "with_checkbook" => CheckbookStatus::WithCheckbook,
        "proof_failed" => CheckbookStatus::ProofFailed,
        "submission_failed" => CheckbookStatus::SubmissionFailed,
        "deleted" => CheckbookStatus::Deleted,
        other => return Err(DomainError::Fatal(format!("unknown checkbook status {other}"))),
    })
}

fn allocation_status_str(s: AllocationStatus) -> &'static str {
    match s {
        AllocationStatus::Idle => "idle",
        AllocationStatus::Pending => "pending",
        AllocationStatus::Used => "used",
    }
}

fn allocation_status_from_str(s: &str) -> Result<AllocationStatus, DomainError> {
    Ok(match s {
        "idle" => AllocationStatus::Idle,
        "pending" => AllocationStatus::Pending,
        "used" => AllocationStatus::Used,
        other => return Err(DomainError::Fatal(format!("unknown allocation status {other}"))),
    })
}

fn proof_status_str(s: ProofStatus) -> &'static str {
    match s {
        ProofStatus::Pending => "pending",
        ProofStatus::InProgress => "in_progress",
        ProofStatus::Completed => "completed",
        ProofStatus::Failed => "failed",
    }
}

fn proof_status_from_str(s: &str) -> Result<ProofStatus, DomainError> {
    Ok(match s {
        "pending" => ProofStatus::Pending,
        "in_progress" => ProofStatus::InProgress,
        "completed" => ProofStatus::Completed,
        "failed" => ProofStatus::Failed,
        other => return Err(DomainError::Fatal(format!("unknown proof status {other}"))),
    })
}

fn execute_status_str(s: ExecuteStatus) -> &'static str {
    match s {
        ExecuteStatus::Pending => "pending",
        ExecuteStatus::Submitted => "submitted",
        ExecuteStatus::Success => "success",
        ExecuteStatus::SubmitFailed => "submit_failed",
        ExecuteStatus::VerifyFailed => "verify_failed",
    }
}

fn execute_status_from_str(s: &str) -> Result<ExecuteStatus, DomainError> {
    Ok(match s {
        "pending" => ExecuteStatus::Pending,
        "submitted" => ExecuteStatus::Submitted,
        "success" => ExecuteStatus::Success,
        "submit_failed" => ExecuteStatus::SubmitFailed,
        "verify_failed" => ExecuteStatus::VerifyFailed,
        other => return Err(DomainError::Fatal(format!("unknown execute status {other}"))),
    })
}

fn payout_status_str(s: PayoutStatus) -> &'static str {
    match s {
        PayoutStatus::Pending => "pending",
        PayoutStatus::Processing => "processing",
        PayoutStatus::Completed => "completed",
        PayoutStatus::Failed => "failed",
    }
}

fn payout_status_from_str(s: &str) -> Result<PayoutStatus, DomainError> {
    Ok(match s {
        "pending" => PayoutStatus::Pending,
        "processing" => PayoutStatus::Processing,
        "completed" => PayoutStatus::Completed,
        "failed" => PayoutStatus::Failed,
        other => return Err(DomainError::Fatal(format!("unknown payout status {other}"))),
    })
}

fn hook_status_str(s: HookStatus) -> &'static str {
    match s {
        HookStatus::NotRequired => "not_required",
        HookStatus::Pending => "pending",
        HookStatus::Processing => "processing",
        HookStatus::Completed => "completed",
        HookStatus::Failed => "failed",
        HookStatus::Abandoned => "abandoned",
    }
}

fn hook_status_from_str(s: &str) -> Result<HookStatus, DomainError> {
    Ok(match s {
        "not_required" => HookStatus::NotRequired,
        "pending" => HookStatus::Pending,
        "processing" => HookStatus::Processing,
        "completed" => HookStatus::Completed,
        "failed" => HookStatus::Failed,
        "abandoned" => HookStatus::Abandoned,
        other => return Err(DomainError::Fatal(format!("unknown hook status {other}"))),
    })
}

fn bytes32(v: Vec<u8>, field: &str) -> Result<[u8; 32], DomainError> {
    v.try_into()
        .map_err(|_| DomainError::Fatal(format!("{field} was not 32 bytes")))
}

fn checkbook_from_row(row: &sqlx::postgres::PgRow) -> Result<Checkbook, DomainError> {
    let commitment: Option<Vec<u8>> = row.try_get("commitment")?;
    Ok(Checkbook {
        id: row.try_get("id")?,
        slip44_chain_id: row.try_get::<i64, _>("slip44_chain_id")? as u32,
        local_deposit_id: row.try_get("local_deposit_id")?,
        owner: UniversalAddress::new(
            row.try_get::<i64, _>("owner_chain_id")? as u32,
            bytes32(row.try_get::<Vec<u8>, _>("owner_data")?, "owner_data")?,
        ),
        token_key: row.try_get("token_key")?,
        gross_amount: Wei(row.try_get("gross_amount")?),
        allocatable_amount: Wei(row.try_get("allocatable_amount")?),
        fee_total_locked: Wei(row.try_get("fee_total_locked")?),
        commitment: commitment.map(|c| bytes32(c, "commitment")).transpose()?,
        status: status_from_str(row.try_get("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn allocation_from_row(row: &sqlx::postgres::PgRow) -> Result<Allocation, DomainError> {
    let nullifier: Option<Vec<u8>> = row.try_get("nullifier")?;
    Ok(Allocation {
        id: row.try_get("id")?,
        checkbook_id: row.try_get("checkbook_id")?,
        seq: row.try_get::<i16, _>("seq")? as u8,
        amount: Wei(row.try_get("amount")?),
        status: allocation_status_from_str(row.try_get("status")?)?,
        nullifier: nullifier.map(|n| bytes32(n, "nullifier")).transpose()?,
        withdraw_request_id: row.try_get("withdraw_request_id")?,
    })
}

fn withdraw_request_from_row(row: &sqlx::postgres::PgRow) -> Result<WithdrawRequest, DomainError> {
    let intent_json: serde_json::Value = row.try_get("intent")?;
    let intent: Intent =
        serde_json::from_value(intent_json).map_err(|e| DomainError::Fatal(e.to_string()))?;
    let min_output_amount: Option<rust_decimal::Decimal> = row.try_get("min_output_amount")?;
    let payout_worker_type: Option<i16> = row.try_get("payout_worker_type")?;
    let hook_min_output_amount: Option<rust_decimal::Decimal> =
        row.try_get("hook_min_output_amount")?;

    Ok(WithdrawRequest {
        id: row.try_get("id")?,
        withdraw_nullifier: row
            .try_get::<Option<Vec<u8>>, _>("withdraw_nullifier")?
            .map(|v| bytes32(v, "withdraw_nullifier"))
            .transpose()?,
        queue_root: row
            .try_get::<Option<Vec<u8>>, _>("queue_root")?
            .map(|v| bytes32(v, "queue_root"))
            .transpose()?,
        owner: UniversalAddress::new(
            row.try_get::<i64, _>("owner_chain_id")? as u32,
            bytes32(row.try_get::<Vec<u8>, _>("owner_data")?, "owner_data")?,
        ),
        intent,
        amount: Wei(row.try_get("amount")?),
        allocation_ids: row.try_get("allocation_ids")?,
        max_slippage_bps: row.try_get::<Option<i64>, _>("max_slippage_bps")?.map(|v| v as u32),
        min_output_amount: min_output_amount.map(Wei),
        payout_deadline: row.try_get("payout_deadline")?,
        proof_status: proof_status_from_str(row.try_get("proof_status")?)?,
        execute_status: execute_status_from_str(row.try_get("execute_status")?)?,
        payout_status: payout_status_from_str(row.try_get("payout_status")?)?,
        hook_status: hook_status_from_str(row.try_get("hook_status")?)?,
        execute_chain_id: row.try_get::<Option<i64>, _>("execute_chain_id")?.map(|v| v as u32),
        execute_tx_hash: row.try_get("execute_tx_hash")?,
        payout_chain_id: row.try_get::<Option<i64>, _>("payout_chain_id")?.map(|v| v as u32),
        payout_tx_hash: row.try_get("payout_tx_hash")?,
        payout_worker_type: payout_worker_type.map(|v| match v {
            0 => PayoutWorkerType::DirectTransfer,
            1 => PayoutWorkerType::UniswapSwap,
            _ => PayoutWorkerType::DeBridgeCrossChain,
        }),
        hook_chain_id: row.try_get::<Option<i64>, _>("hook_chain_id")?.map(|v| v as u32),
        hook_tx_hash: row.try_get("hook_tx_hash")?,
        hook_intent_type: row.try_get("hook_intent_type")?,
        hook_token_id: row.try_get("hook_token_id")?,
        hook_worker_id: row.try_get("hook_worker_id")?,
        hook_min_output_amount: hook_min_output_amount.map(Wei),
        proof_retry_count: row.try_get::<i32, _>("proof_retry_count")? as u32,
        execute_retry_count: row.try_get::<i32, _>("execute_retry_count")? as u32,
        fallback_transferred: row.try_get("fallback_transferred")?,
        user_cancelled: row.try_get("user_cancelled")?,
        proof_error: row.try_get("proof_error")?,
        execute_error: row.try_get("execute_error")?,
        payout_error: row.try_get("payout_error")?,
        hook_error: row.try_get("hook_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Processing => "processing",
        TaskStatus::Submitted => "submitted",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn task_status_from_str(s: &str) -> Result<TaskStatus, DomainError> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "processing" => TaskStatus::Processing,
        "submitted" => TaskStatus::Submitted,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        other => return Err(DomainError::Fatal(format!("unknown task status {other}"))),
    })
}

fn proof_generation_task_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<ProofGenerationTask, DomainError> {
    let data: serde_json::Value = row.try_get("task_data")?;
    Ok(TaskRow {
        id: row.try_get("id")?,
        status: task_status_from_str(row.try_get("status")?)?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        priority: row.try_get("priority")?,
        task_data: serde_json::from_value(data).map_err(|e| DomainError::Fatal(e.to_string()))?,
        submission_context: row.try_get("submission_context")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn withdraw_proof_generation_task_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<WithdrawProofGenerationTask, DomainError> {
    let data: serde_json::Value = row.try_get("task_data")?;
    Ok(TaskRow {
        id: row.try_get("id")?,
        status: task_status_from_str(row.try_get("status")?)?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        priority: row.try_get("priority")?,
        task_data: serde_json::from_value(data).map_err(|e| DomainError::Fatal(e.to_string()))?,
        submission_context: row.try_get("submission_context")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn pending_transaction_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<PendingTransaction, DomainError> {
    let data: serde_json::Value = row.try_get("task_data")?;
    Ok(TaskRow {
        id: row.try_get("id")?,
        status: task_status_from_str(row.try_get("status")?)?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        priority: row.try_get("priority")?,
        task_data: serde_json::from_value(data).map_err(|e| DomainError::Fatal(e.to_string()))?,
        submission_context: row.try_get("submission_context")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn polling_task_from_row(row: &sqlx::postgres::PgRow) -> Result<PollingTask, DomainError> {
    let data: serde_json::Value = row.try_get("data")?;
    Ok(PollingTask {
        id: row.try_get("id")?,
        status: task_status_from_str(row.try_get("status")?)?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        next_poll_at: row.try_get("next_poll_at")?,
        poll_interval_secs: row.try_get::<i64, _>("poll_interval_secs")? as u64,
        data: serde_json::from_value(data).map_err(|e| DomainError::Fatal(e.to_string()))?,
        last_error: row.try_get("last_error")?,
    })
}

fn subgraph_cursor_from_row(row: &sqlx::postgres::PgRow) -> Result<SubgraphCursor, DomainError> {
    Ok(SubgraphCursor {
        chain_id: row.try_get::<i64, _>("chain_id")? as u32,
        subgraph_url: row.try_get("subgraph_url")?,
        last_synced_block: row.try_get::<i64, _>("last_synced_block")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            CheckbookStatus::Pending,
            CheckbookStatus::Unsigned,
            CheckbookStatus::ReadyForCommitment,
            CheckbookStatus::GeneratingProof,
            CheckbookStatus::SubmittingCommitment,
            CheckbookStatus::CommitmentPending,
            CheckbookStatus::WithCheckbook,
            CheckbookStatus::ProofFailed,
            CheckbookStatus::SubmissionFailed,
            CheckbookStatus::Deleted,
        ] {
            assert_eq!(status_from_str(status_str(s)).unwrap(), s);
        }
    }

    #[test]
    fn execute_status_round_trips() {
        for s in [
            ExecuteStatus::Pending,
            ExecuteStatus::Submitted,
            ExecuteStatus::Success,
            ExecuteStatus::SubmitFailed,
            ExecuteStatus::VerifyFailed,
        ] {
            assert_eq!(execute_status_from_str(execute_status_str(s)).unwrap(), s);
        }
    }
}
