//! In-memory `RepositoryPort` double, modeled on the teacher's
//! `InMemoryStore` (DashMap-backed, trait-per-concern). Used by the
//! orchestrator-level end-to-end scenario tests (S1-S6) that exercise the
//! commitment pipeline, withdraw orchestrator, and tx queue without a live
//! Postgres instance.

use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::DomainError;

use super::models::*;
use super::repository::RepositoryPort;

#[derive(Default)]
pub struct InMemoryRepository {
    checkbooks: DashMap<Uuid, Checkbook>,
    checkbook_by_deposit: DashMap<(u32, String), Uuid>,
    allocations: DashMap<Uuid, Allocation>,
    withdraw_requests: DashMap<Uuid, WithdrawRequest>,
    proof_tasks: Mutex<Vec<ProofGenerationTask>>,
    withdraw_proof_tasks: Mutex<Vec<WithdrawProofGenerationTask>>,
    pending_transactions: Mutex<Vec<PendingTransaction>>,
    polling_tasks: Mutex<Vec<PollingTask>>,
    seen_events: DashMap<(u32, String, u64), ()>,
    payout_retries: Mutex<Vec<PayoutRetryRecord>>,
    fallback_retries: Mutex<Vec<FallbackRetryRecord>>,
    subgraph_cursors: DashMap<(u32, String), u64>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_proof_task(&self, task: ProofGenerationTask) {
        self.proof_tasks.lock().unwrap().push(task);
    }

    pub fn push_withdraw_proof_task(&self, task: WithdrawProofGenerationTask) {
        self.withdraw_proof_tasks.lock().unwrap().push(task);
    }

    pub fn push_pending_transaction(&self, tx: PendingTransaction) {
        self.pending_transactions.lock().unwrap().push(tx);
    }

    pub fn push_polling_task(&self, task: PollingTask) {
        self.polling_tasks.lock().unwrap().push(task);
    }
}

fn claim_due<T: Clone>(
    rows: &mut Vec<T>,
    is_due: impl Fn(&T) -> bool,
    status_of: impl Fn(&T) -> TaskStatus,
    set_processing: impl Fn(&mut T),
    priority_of: impl Fn(&T) -> i32,
) -> Option<T> {
    let idx = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| status_of(r) == TaskStatus::Pending && is_due(r))
        .min_by_key(|(_, r)| priority_of(r))
        .map(|(i, _)| i)?;
    set_processing(&mut rows[idx]);
    Some(rows[idx].clone())
}

#[async_trait::async_trait]
impl RepositoryPort for InMemoryRepository {
    async fn ping(&self) -> Result<(), DomainError> {
        Ok(())
    }

    async fn create_checkbook_if_not_exists(&self, new: &Checkbook) -> Result<Checkbook, DomainError> {
        let key = (new.slip44_chain_id, new.local_deposit_id.clone());
        if let Some(existing_id) = self.checkbook_by_deposit.get(&key) {
            return Ok(self.checkbooks.get(&existing_id).unwrap().clone());
        }
        self.checkbook_by_deposit.insert(key, new.id);
        self.checkbooks.insert(new.id, new.clone());
        Ok(new.clone())
    }

    async fn find_checkbook_by_deposit(
        &self,
        slip44_chain_id: u32,
        local_deposit_id: &str,
    ) -> Result<Option<Checkbook>, DomainError> {
        let key = (slip44_chain_id, local_deposit_id.to_string());
        Ok(self
            .checkbook_by_deposit
            .get(&key)
            .and_then(|id| self.checkbooks.get(&id).map(|r| r.clone())))
    }

    async fn find_checkbook_by_commitment(
        &self,
        slip44_chain_id: u32,
        commitment: [u8; 32],
    ) -> Result<Option<Checkbook>, DomainError> {
        Ok(self
            .checkbooks
            .iter()
            .find(|r| r.slip44_chain_id == slip44_chain_id && r.commitment == Some(commitment))
            .map(|r| r.clone()))
    }

    async fn get_checkbook(&self, id: Uuid) -> Result<Checkbook, DomainError> {
        self.checkbooks
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| DomainError::Conflict(format!("checkbook {id} not found")))
    }

    async fn set_checkbook_commitment(&self, id: Uuid, commitment: [u8; 32]) -> Result<(), DomainError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("checkbook {id} not found")))?;
        entry.commitment = Some(commitment);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn advance_checkbook_status_if_current(
        &self,
        id: Uuid,
        expected: CheckbookStatus,
        next: CheckbookStatus,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("checkbook {id} not found")))?;
        if entry.status != expected {
            return Err(DomainError::Conflict(format!(
                "checkbook {id} status was not {expected:?}"
            )));
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_allocations(&self, allocations: &[Allocation]) -> Result<(), DomainError> {
        for a in allocations {
            self.allocations.insert(a.id, a.clone());
        }
        Ok(())
    }

    async fn list_allocations_for_checkbook(&self, checkbook_id: Uuid) -> Result<Vec<Allocation>, DomainError> {
        let mut out: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|a| a.checkbook_id == checkbook_id)
            .map(|a| a.clone())
            .collect();
        out.sort_by_key(|a| a.seq);
        Ok(out)
    }

    async fn reserve_allocations(
        &self,
        allocation_ids: &[Uuid],
        withdraw_request_id: Uuid,
    ) -> Result<(), DomainError> {
        for id in allocation_ids {
            let entry = self
                .allocations
                .get_mut(id)
                .ok_or_else(|| DomainError::Conflict(format!("allocation {id} not found")))?;
            if entry.status != AllocationStatus::Idle {
                return Err(DomainError::Conflict(format!("allocation {id} is not idle")));
            }
        }
        for id in allocation_ids {
            let mut entry = self.allocations.get_mut(id).unwrap();
            entry.status = AllocationStatus::Pending;
            entry.withdraw_request_id = Some(withdraw_request_id);
        }
        Ok(())
    }

    async fn get_allocations(&self, ids: &[Uuid]) -> Result<Vec<Allocation>, DomainError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.allocations.get(id).map(|a| a.clone()))
            .collect())
    }

    async fn release_allocations(&self, ids: &[Uuid]) -> Result<(), DomainError> {
        for id in ids {
            if let Some(mut entry) = self.allocations.get_mut(id) {
                if entry.status == AllocationStatus::Pending {
                    entry.status = AllocationStatus::Idle;
                    entry.withdraw_request_id = None;
                }
            }
        }
        Ok(())
    }

    async fn mark_allocations_used(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        for (id, nullifier) in pairs {
            if let Some(mut entry) = self.allocations.get_mut(id) {
                if entry.status == AllocationStatus::Pending {
                    entry.status = AllocationStatus::Used;
                    entry.nullifier = Some(*nullifier);
                }
            }
        }
        Ok(())
    }

    async fn mark_allocations_idle_with_nullifiers(&self, pairs: &[(Uuid, [u8; 32])]) -> Result<(), DomainError> {
        for (id, nullifier) in pairs {
            if let Some(mut entry) = self.allocations.get_mut(id) {
                if entry.status == AllocationStatus::Pending {
                    entry.status = AllocationStatus::Idle;
                    entry.nullifier = Some(*nullifier);
                }
            }
        }
        Ok(())
    }

    async fn create_withdraw_request_if_not_exists(
        &self,
        new: &WithdrawRequest,
    ) -> Result<WithdrawRequest, DomainError> {
        if let Some(existing) = self.withdraw_requests.get(&new.id) {
            return Ok(existing.clone());
        }
        self.withdraw_requests.insert(new.id, new.clone());
        Ok(new.clone())
    }

    async fn get_withdraw_request(&self, id: Uuid) -> Result<WithdrawRequest, DomainError> {
        self.withdraw_requests
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))
    }

    async fn find_withdraw_request_by_nullifier(
        &self,
        nullifier: [u8; 32],
    ) -> Result<Option<WithdrawRequest>, DomainError> {
        Ok(self
            .withdraw_requests
            .iter()
            .find(|r| r.withdraw_nullifier == Some(nullifier))
            .map(|r| r.clone()))
    }

    async fn advance_proof_status_if_current(
        &self,
        id: Uuid,
        expected: ProofStatus,
        next: ProofStatus,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        if entry.proof_status != expected {
            return Err(DomainError::Conflict("proof_status mismatch".into()));
        }
        entry.proof_status = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn advance_execute_status_if_current(
        &self,
        id: Uuid,
        expected: ExecuteStatus,
        next: ExecuteStatus,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        if entry.execute_status != expected {
            return Err(DomainError::Conflict("execute_status mismatch".into()));
        }
        entry.execute_status = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn advance_payout_status_if_current(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        if entry.payout_status != expected {
            return Err(DomainError::Conflict("payout_status mismatch".into()));
        }
        entry.payout_status = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn advance_hook_status_if_current(
        &self,
        id: Uuid,
        expected: HookStatus,
        next: HookStatus,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        if entry.hook_status != expected {
            return Err(DomainError::Conflict("hook_status mismatch".into()));
        }
        entry.hook_status = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_user_cancelled(&self, id: Uuid) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        entry.user_cancelled = true;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_withdraw_fields(
        &self,
        id: Uuid,
        update: &super::repository::WithdrawFieldUpdate,
    ) -> Result<(), DomainError> {
        let mut entry = self
            .withdraw_requests
            .get_mut(&id)
            .ok_or_else(|| DomainError::Conflict(format!("withdraw_request {id} not found")))?;
        if let Some(v) = update.withdraw_nullifier {
            entry.withdraw_nullifier = Some(v);
        }
        if let Some(v) = update.queue_root {
            entry.queue_root = Some(v);
        }
        if let Some(v) = update.execute_chain_id {
            entry.execute_chain_id = Some(v);
        }
        if let Some(v) = &update.execute_tx_hash {
            entry.execute_tx_hash = Some(v.clone());
        }
        if let Some(v) = update.payout_chain_id {
            entry.payout_chain_id = Some(v);
        }
        if let Some(v) = &update.payout_tx_hash {
            entry.payout_tx_hash = Some(v.clone());
        }
        if let Some(v) = update.payout_worker_type {
            entry.payout_worker_type = Some(v);
        }
        if let Some(v) = update.hook_chain_id {
            entry.hook_chain_id = Some(v);
        }
        if let Some(v) = &update.hook_tx_hash {
            entry.hook_tx_hash = Some(v.clone());
        }
        if let Some(v) = &update.hook_intent_type {
            entry.hook_intent_type = Some(v.clone());
        }
        if let Some(v) = &update.hook_token_id {
            entry.hook_token_id = Some(v.clone());
        }
        if let Some(v) = &update.hook_worker_id {
            entry.hook_worker_id = Some(v.clone());
        }
        if let Some(v) = update.hook_min_output_amount {
            entry.hook_min_output_amount = Some(v);
        }
        if let Some(v) = &update.proof_error {
            entry.proof_error = Some(v.clone());
        }
        if let Some(v) = &update.execute_error {
            entry.execute_error = Some(v.clone());
        }
        if let Some(v) = &update.payout_error {
            entry.payout_error = Some(v.clone());
        }
        if let Some(v) = &update.hook_error {
            entry.hook_error = Some(v.clone());
        }
        if let Some(v) = update.proof_retry_count {
            entry.proof_retry_count = v;
        }
        if let Some(v) = update.execute_retry_count {
            entry.execute_retry_count = v;
        }
        if let Some(v) = update.fallback_transferred {
            entry.fallback_transferred = v;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn record_payout_retry(&self, record: &PayoutRetryRecord) -> Result<(), DomainError> {
        self.payout_retries.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn record_fallback_retry(&self, record: &FallbackRetryRecord) -> Result<(), DomainError> {
        self.fallback_retries.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn insert_proof_generation_task(&self, task: &ProofGenerationTask) -> Result<(), DomainError> {
        self.push_proof_task(task.clone());
        Ok(())
    }

    async fn insert_withdraw_proof_generation_task(
        &self,
        task: &WithdrawProofGenerationTask,
    ) -> Result<(), DomainError> {
        self.push_withdraw_proof_task(task.clone());
        Ok(())
    }

    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> Result<(), DomainError> {
        self.push_pending_transaction(tx.clone());
        Ok(())
    }

    async fn insert_polling_task(&self, task: &PollingTask) -> Result<(), DomainError> {
        self.push_polling_task(task.clone());
        Ok(())
    }

    async fn claim_one_pending_proof_task(&self) -> Result<Option<ProofGenerationTask>, DomainError> {
        let mut rows = self.proof_tasks.lock().unwrap();
        Ok(claim_due(
            &mut rows,
            |r| r.next_retry_at.map(|t| t <= Utc::now()).unwrap_or(true),
            |r| r.status,
            |r| r.status = TaskStatus::Processing,
            |r| r.priority,
        ))
    }

    async fn claim_one_pending_withdraw_proof_task(
        &self,
    ) -> Result<Option<WithdrawProofGenerationTask>, DomainError> {
        let mut rows = self.withdraw_proof_tasks.lock().unwrap();
        Ok(claim_due(
            &mut rows,
            |r| r.next_retry_at.map(|t| t <= Utc::now()).unwrap_or(true),
            |r| r.status,
            |r| r.status = TaskStatus::Processing,
            |r| r.priority,
        ))
    }

    async fn claim_one_pending_transaction(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<PendingTransaction>, DomainError> {
        let mut rows = self.pending_transactions.lock().unwrap();
        Ok(claim_due(
            &mut rows,
            |r| {
                r.task_data.sender_address == sender_address
                    && r.task_data.chain_id == chain_id
                    && r.next_retry_at.map(|t| t <= Utc::now()).unwrap_or(true)
            },
            |r| r.status,
            |r| r.status = TaskStatus::Processing,
            |r| r.priority,
        ))
    }

    async fn list_submitted_transactions(&self) -> Result<Vec<PendingTransaction>, DomainError> {
        Ok(self
            .pending_transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == TaskStatus::Submitted)
            .cloned()
            .collect())
    }

    async fn highest_assigned_nonce(
        &self,
        sender_address: &str,
        chain_id: u32,
    ) -> Result<Option<u64>, DomainError> {
        Ok(self
            .pending_transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.task_data.sender_address == sender_address
                    && r.task_data.chain_id == chain_id
                    && matches!(r.status, TaskStatus::Processing | TaskStatus::Submitted)
            })
            .filter_map(|r| r.task_data.assigned_nonce)
            .max())
    }

    async fn mark_transaction_submitted(
        &self,
        id: Uuid,
        nonce: u64,
        tx_hash: &str,
    ) -> Result<(), DomainError> {
        let mut rows = self.pending_transactions.lock().unwrap();
        let r = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DomainError::Conflict(format!("pending_transaction {id} not found")))?;
        if r.status != TaskStatus::Processing {
            return Err(DomainError::Conflict("transaction not in processing".into()));
        }
        r.status = TaskStatus::Submitted;
        r.task_data.assigned_nonce = Some(nonce);
        r.submission_context = Some(serde_json::json!({ "tx_hash": tx_hash }));
        Ok(())
    }

    async fn record_gas_bump(&self, id: Uuid, tx_hash: &str) -> Result<(), DomainError> {
        if let Some(r) = self.pending_transactions.lock().unwrap().iter_mut().find(|r| r.id == id) {
            r.task_data.gas_bump_count += 1;
            r.submission_context = Some(serde_json::json!({ "tx_hash": tx_hash }));
        }
        Ok(())
    }

    async fn claim_one_due_polling_task(&self) -> Result<Option<PollingTask>, DomainError> {
        let mut rows = self.polling_tasks.lock().unwrap();
        Ok(claim_due(
            &mut rows,
            |r| r.next_poll_at <= Utc::now(),
            |r| r.status,
            |r| r.status = TaskStatus::Processing,
            |_| 0,
        ))
    }

    async fn complete_polling_task(&self, id: Uuid) -> Result<(), DomainError> {
        if let Some(r) = self.polling_tasks.lock().unwrap().iter_mut().find(|r| r.id == id) {
            r.status = TaskStatus::Completed;
        }
        Ok(())
    }

    async fn reschedule_or_fail_polling_task(&self, task: &PollingTask, error: &str) -> Result<(), DomainError> {
        if let Some(r) = self.polling_tasks.lock().unwrap().iter_mut().find(|r| r.id == task.id) {
            r.retry_count += 1;
            r.last_error = Some(error.to_string());
            if r.retry_count >= r.max_retries {
                r.status = TaskStatus::Failed;
            } else {
                r.status = TaskStatus::Pending;
                r.next_poll_at = Utc::now() + chrono::Duration::seconds(r.poll_interval_secs as i64);
            }
        }
        Ok(())
    }

    async fn complete_task(&self, table: &str, id: Uuid) -> Result<(), DomainError> {
        self.fail_task(table, id, "", None).await.ok();
        match table {
            "proof_generation_tasks" => {
                if let Some(r) = self.proof_tasks.lock().unwrap().iter_mut().find(|r| r.id == id) {
                    r.status = TaskStatus::Completed;
                }
            }
            "withdraw_proof_generation_tasks" => {
                if let Some(r) = self
                    .withdraw_proof_tasks
                    .lock()
                    .unwrap()
                    .iter_mut()
                    .find(|r| r.id == id)
                {
                    r.status = TaskStatus::Completed;
                }
            }
            "pending_transactions" => {
                if let Some(r) = self
                    .pending_transactions
                    .lock()
                    .unwrap()
                    .iter_mut()
                    .find(|r| r.id == id)
                {
                    r.status = TaskStatus::Completed;
                }
            }
            "polling_tasks" => {
                if let Some(r) = self.polling_tasks.lock().unwrap().iter_mut().find(|r| r.id == id) {
                    r.status = TaskStatus::Completed;
                }
            }
            other => return Err(DomainError::Fatal(format!("unknown task table {other}"))),
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        table: &str,
        id: Uuid,
        error: &str,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DomainError> {
        let status = if next_retry_at.is_some() {
            TaskStatus::Pending
        } else {
            TaskStatus::Failed
        };
        macro_rules! apply {
            ($rows:expr) => {
                if let Some(r) = $rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
                    r.status = status;
                    r.retry_count += if error.is_empty() { 0 } else { 1 };
                    r.next_retry_at = next_retry_at;
                    if !error.is_empty() {
                        r.last_error = Some(error.to_string());
                    }
                }
            };
        }
        match table {
            "proof_generation_tasks" => apply!(self.proof_tasks),
            "withdraw_proof_generation_tasks" => apply!(self.withdraw_proof_tasks),
            "pending_transactions" => apply!(self.pending_transactions),
            "polling_tasks" => apply!(self.polling_tasks),
            other => return Err(DomainError::Fatal(format!("unknown task table {other}"))),
        }
        Ok(())
    }

    async fn recover_stuck_processing_rows(&self, table: &str) -> Result<u64, DomainError> {
        macro_rules! recover {
            ($rows:expr) => {{
                let mut rows = $rows.lock().unwrap();
                let mut n = 0u64;
                for r in rows.iter_mut() {
                    if r.status == TaskStatus::Processing {
                        r.status = TaskStatus::Pending;
                        n += 1;
                    }
                }
                n
            }};
        }
        Ok(match table {
            "proof_generation_tasks" => recover!(self.proof_tasks),
            "withdraw_proof_generation_tasks" => recover!(self.withdraw_proof_tasks),
            "pending_transactions" => recover!(self.pending_transactions),
            "polling_tasks" => recover!(self.polling_tasks),
            other => return Err(DomainError::Fatal(format!("unknown task table {other}"))),
        })
    }

    async fn record_event_if_new(&self, row: &EventLogRow) -> Result<bool, DomainError> {
        let key = (row.chain_id, row.transaction_hash.clone(), row.log_index);
        if self.seen_events.contains_key(&key) {
            return Ok(false);
        }
        self.seen_events.insert(key, ());
        Ok(true)
    }

    async fn get_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
    ) -> Result<Option<SubgraphCursor>, DomainError> {
        Ok(self
            .subgraph_cursors
            .get(&(chain_id, subgraph_url.to_string()))
            .map(|last_synced_block| SubgraphCursor {
                chain_id,
                subgraph_url: subgraph_url.to_string(),
                last_synced_block: *last_synced_block,
            }))
    }

    async fn advance_subgraph_cursor(
        &self,
        chain_id: u32,
        subgraph_url: &str,
        last_synced_block: u64,
    ) -> Result<(), DomainError> {
        self.subgraph_cursors
            .entry((chain_id, subgraph_url.to_string()))
            .and_modify(|v| *v = (*v).max(last_synced_block))
            .or_insert(last_synced_block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::address::UniversalAddress;

    fn sample_checkbook() -> Checkbook {
        Checkbook {
            id: Uuid::new_v4(),
            slip44_chain_id: 714,
            local_deposit_id: "dep-1".into(),
            owner: UniversalAddress::new(714, [1; 32]),
            token_key: "USDT".into(),
            gross_amount: Wei::from_str("1000").unwrap(),
            allocatable_amount: Wei::from_str("990").unwrap(),
            fee_total_locked: Wei::from_str("10").unwrap(),
            commitment: None,
            status: CheckbookStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_if_not_exists_is_idempotent() {
        let repo = InMemoryRepository::new();
        let cb = sample_checkbook();
        let first = repo.create_checkbook_if_not_exists(&cb).await.unwrap();
        let mut cb2 = cb.clone();
        cb2.id = Uuid::new_v4();
        let second = repo.create_checkbook_if_not_exists(&cb2).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_status() {
        let repo = InMemoryRepository::new();
        let cb = sample_checkbook();
        repo.create_checkbook_if_not_exists(&cb).await.unwrap();
        repo.advance_checkbook_status_if_current(cb.id, CheckbookStatus::Pending, CheckbookStatus::Unsigned)
            .await
            .unwrap();
        let result = repo
            .advance_checkbook_status_if_current(cb.id, CheckbookStatus::Pending, CheckbookStatus::Unsigned)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn record_event_if_new_deduplicates() {
        let repo = InMemoryRepository::new();
        let row = EventLogRow {
            id: Uuid::new_v4(),
            chain_id: 714,
            transaction_hash: "0xabc".into(),
            log_index: 0,
            event_name: "DepositRecorded".into(),
            block_number: 100,
            payload: serde_json::json!({}),
            received_at: Utc::now(),
        };
        assert!(repo.record_event_if_new(&row).await.unwrap());
        assert!(!repo.record_event_if_new(&row).await.unwrap());
    }
}
