//! Withdraw Orchestrator (spec §4.5): the four-stage state machine driving
//! a `WithdrawRequest` from creation through proof, execute, payout, and an
//! optional hook purchase. Every transition is a CAS on one of the four
//! sub-status columns; `set_withdraw_fields` records the side-channel data
//! (tx hashes, errors, hook calldata) as a second, separate call rather
//! than folding it into the same statement as the CAS — a deliberate
//! simplification over one atomic combined update.
//!
//! This module owns no collaborators of its own (no chain RPC, no signer,
//! no prover client): every stage method takes the material a specific
//! collaborator already produced (a signed tx's calldata, a prover's
//! result, an observed event) and only updates the repository. Wiring the
//! collaborators to call these methods happens in the ingestor / proof
//! runner / tx queue modules.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::chain::address::UniversalAddress;
use crate::db::models::{
    AllocationStatus, CommitmentGroup, ExecuteStatus, FallbackRetryRecord, HookStatus, Intent,
    PayoutRetryRecord, PayoutStatus, PayoutWorkerType, PendingTransactionData, PendingTxKind,
    ProofStatus, TaskRow, TaskStatus, Wei, WithdrawProofGenerationTaskData, WithdrawRequest,
    WithdrawStatus,
};
use crate::db::repository::{RepositoryPort, WithdrawFieldUpdate};
use crate::error::DomainError;

use super::rollup::rollup_status;

const DEFAULT_PROOF_MAX_RETRIES: u32 = 5;

pub struct WithdrawOrchestrator {
    repo: Arc<dyn RepositoryPort>,
}

/// What a client submits to start a withdraw (spec §4.5 Stage 1).
#[derive(Debug, Clone)]
pub struct CreateWithdrawCommand {
    pub owner: UniversalAddress,
    pub intent: Intent,
    pub amount: Wei,
    pub allocation_ids: Vec<Uuid>,
    pub max_slippage_bps: Option<u32>,
    pub min_output_amount: Option<Wei>,
    pub payout_deadline: Option<chrono::DateTime<Utc>>,
    pub source_chain_name: Option<String>,
    pub target_chain_name: Option<String>,
    pub source_token_symbol: String,
    pub signature: String,
}

/// What the proof task runner hands back after a withdraw proof succeeds.
#[derive(Debug, Clone)]
pub struct WithdrawProofResult {
    pub nullifiers: Vec<[u8; 32]>,
    pub commitment_root: [u8; 32],
}

/// Tx material for the Execute-chain `executeWithdraw` call, already built
/// and signed by the tx queue's collaborators.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub chain_id: u32,
    pub sender_address: String,
    pub to_address: String,
    pub calldata: String,
}

/// Hook calldata carried by the on-chain `WithdrawRequested` event (spec
/// §4.5 Stage 2's "On success... Hook CallData fields").
#[derive(Debug, Clone)]
pub struct HookCallData {
    pub hook_intent_type: String,
    pub hook_chain_id: u32,
    pub hook_token_id: String,
    pub hook_worker_id: String,
    pub hook_min_output_amount: Option<Wei>,
}

#[derive(Debug, Clone)]
pub struct PayoutParams {
    pub chain_id: u32,
    pub sender_address: String,
    pub to_address: String,
    pub calldata: String,
    pub worker_type: PayoutWorkerType,
}

#[derive(Debug, Clone)]
pub struct HookParams {
    pub chain_id: u32,
    pub sender_address: String,
    pub to_address: String,
    pub calldata: String,
}

impl WithdrawOrchestrator {
    pub fn new(repo: Arc<dyn RepositoryPort>) -> Self {
        Self { repo }
    }

    /// Stage 1: reserves allocations, creates the request row, enqueues the
    /// withdraw proof generation task.
    pub async fn create(&self, cmd: CreateWithdrawCommand) -> Result<WithdrawRequest, DomainError> {
        let allocations = self.repo.get_allocations(&cmd.allocation_ids).await?;
        if allocations.len() != cmd.allocation_ids.len() {
            return Err(DomainError::Invalid("unknown allocation id in request".into()));
        }
        for a in &allocations {
            if a.status != AllocationStatus::Idle {
                return Err(DomainError::Conflict(format!("allocation {} is not idle", a.id)));
            }
            if a.withdraw_request_id.is_some() {
                return Err(DomainError::Conflict(format!("allocation {} already claimed", a.id)));
            }
        }
        let sum = allocations
            .iter()
            .map(|a| a.amount.clone())
            .sum::<Wei>();
        if sum != cmd.amount {
            return Err(DomainError::Invalid(format!(
                "allocation sum {sum} does not cover requested amount {}",
                cmd.amount
            )));
        }

        let id = Uuid::new_v4();
        self.repo.reserve_allocations(&cmd.allocation_ids, id).await?;

        let new = WithdrawRequest {
            id,
            withdraw_nullifier: None,
            queue_root: None,
            owner: cmd.owner.clone(),
            intent: cmd.intent.clone(),
            amount: cmd.amount.clone(),
            allocation_ids: cmd.allocation_ids.clone(),
            max_slippage_bps: cmd.max_slippage_bps,
            min_output_amount: cmd.min_output_amount.clone(),
            payout_deadline: cmd.payout_deadline,
            proof_status: ProofStatus::Pending,
            execute_status: ExecuteStatus::Pending,
            payout_status: PayoutStatus::Pending,
            hook_status: HookStatus::NotRequired,
            execute_chain_id: None,
            execute_tx_hash: None,
            payout_chain_id: None,
            payout_tx_hash: None,
            payout_worker_type: None,
            hook_chain_id: None,
            hook_tx_hash: None,
            hook_intent_type: None,
            hook_token_id: None,
            hook_worker_id: None,
            hook_min_output_amount: None,
            proof_retry_count: 0,
            execute_retry_count: 0,
            fallback_transferred: false,
            user_cancelled: false,
            proof_error: None,
            execute_error: None,
            payout_error: None,
            hook_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = self.repo.create_withdraw_request_if_not_exists(&new).await?;

        let mut by_checkbook: HashMap<Uuid, Vec<(u8, Wei)>> = HashMap::new();
        for a in &allocations {
            by_checkbook
                .entry(a.checkbook_id)
                .or_default()
                .push((a.seq, a.amount.clone()));
        }
        let commitment_groups = by_checkbook
            .into_iter()
            .map(|(checkbook_id, allocations)| CommitmentGroup { checkbook_id, allocations })
            .collect();

        let task = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_PROOF_MAX_RETRIES,
            next_retry_at: None,
            priority: 0,
            task_data: WithdrawProofGenerationTaskData {
                withdraw_request_id: created.id,
                commitment_groups,
                owner: created.owner.clone(),
                intent: created.intent.clone(),
                source_chain_name: cmd.source_chain_name,
                target_chain_name: cmd.target_chain_name,
                source_token_symbol: cmd.source_token_symbol,
                min_output: created.min_output_amount.clone(),
                signature: cmd.signature,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_withdraw_proof_generation_task(&task).await?;

        Ok(created)
    }

    pub async fn start_proof(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_proof_status_if_current(id, ProofStatus::Pending, ProofStatus::InProgress)
            .await
    }

    /// Stage 1 success: persists the prover's result and enqueues the
    /// Execute-chain transaction.
    pub async fn complete_proof(
        &self,
        id: Uuid,
        result: &WithdrawProofResult,
        execute: ExecuteParams,
    ) -> Result<(), DomainError> {
        self.repo
            .advance_proof_status_if_current(id, ProofStatus::InProgress, ProofStatus::Completed)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    withdraw_nullifier: result.nullifiers.first().copied(),
                    queue_root: Some(result.commitment_root),
                    ..Default::default()
                },
            )
            .await?;

        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_PROOF_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::WithdrawExecute.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::WithdrawExecute,
                sender_address: execute.sender_address,
                chain_id: execute.chain_id,
                to_address: execute.to_address,
                calldata: execute.calldata,
                value: Wei::ZERO,
                withdraw_request_id: Some(id),
                checkbook_id: None,
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_pending_transaction(&tx).await
    }

    /// Stage 1 failure: retries while under the cap, otherwise terminal.
    pub async fn fail_proof(&self, id: Uuid, error: &str, max_retries: u32) -> Result<(), DomainError> {
        let current = self.repo.get_withdraw_request(id).await?;
        let retry_count = current.proof_retry_count + 1;
        let next = if retry_count < max_retries {
            ProofStatus::Pending
        } else {
            ProofStatus::Failed
        };
        self.repo
            .advance_proof_status_if_current(id, ProofStatus::InProgress, next)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    proof_error: Some(error.to_string()),
                    proof_retry_count: Some(retry_count),
                    ..Default::default()
                },
            )
            .await
    }

    /// Stage 2: submission accepted by the chain's mempool.
    pub async fn execute_submitted(&self, id: Uuid, chain_id: u32, tx_hash: String) -> Result<(), DomainError> {
        self.repo
            .advance_execute_status_if_current(id, ExecuteStatus::Pending, ExecuteStatus::Submitted)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    execute_chain_id: Some(chain_id),
                    execute_tx_hash: Some(tx_hash),
                    ..Default::default()
                },
            )
            .await
    }

    /// Stage 2: RPC/mempool error before a tx_hash exists. Retriable —
    /// `CanRetryExecute()` becomes true.
    pub async fn execute_submit_failed(&self, id: Uuid, error: &str) -> Result<(), DomainError> {
        self.repo
            .advance_execute_status_if_current(id, ExecuteStatus::Pending, ExecuteStatus::SubmitFailed)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate { execute_error: Some(error.to_string()), ..Default::default() },
            )
            .await
    }

    /// Re-enqueues a `submit_failed` request's Execute transaction.
    pub async fn retry_execute(&self, id: Uuid, execute: ExecuteParams) -> Result<(), DomainError> {
        self.repo
            .advance_execute_status_if_current(id, ExecuteStatus::SubmitFailed, ExecuteStatus::Pending)
            .await?;
        let current = self.repo.get_withdraw_request(id).await?;
        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_PROOF_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::WithdrawExecute.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::WithdrawExecute,
                sender_address: execute.sender_address,
                chain_id: execute.chain_id,
                to_address: execute.to_address,
                calldata: execute.calldata,
                value: Wei::ZERO,
                withdraw_request_id: Some(id),
                checkbook_id: None,
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    execute_retry_count: Some(current.execute_retry_count + 1),
                    ..Default::default()
                },
            )
            .await?;
        self.repo.insert_pending_transaction(&tx).await
    }

    /// Stage 2: receipt confirmed ok.
    pub async fn execute_success(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_execute_status_if_current(id, ExecuteStatus::Submitted, ExecuteStatus::Success)
            .await
    }

    /// The ingestor calls this once it observes the on-chain
    /// `WithdrawExecuted` event, which is the authoritative source for
    /// which nullifiers the contract actually consumed. Matches
    /// `nullifiers` against `allocation_ids` positionally — the same
    /// order the proof request submitted them in. Independent of
    /// `execute_success`'s receipt-driven CAS: a tx confirmation and this
    /// event can arrive in either order, and `mark_allocations_used` is
    /// itself idempotent (no-ops on an allocation already `used`).
    pub async fn record_withdraw_executed(&self, id: Uuid, nullifiers: &[[u8; 32]]) -> Result<(), DomainError> {
        let current = self.repo.get_withdraw_request(id).await?;
        let pairs: Vec<(Uuid, [u8; 32])> =
            current.allocation_ids.iter().copied().zip(nullifiers.iter().copied()).collect();
        self.repo.mark_allocations_used(&pairs).await
    }

    /// Stage 2: receipt confirmed reverted. Non-retriable — cancellation
    /// becomes mandatory (`must_cancel`) to release the allocations.
    pub async fn execute_verify_failed(&self, id: Uuid, error: &str) -> Result<(), DomainError> {
        self.repo
            .advance_execute_status_if_current(id, ExecuteStatus::Submitted, ExecuteStatus::VerifyFailed)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate { execute_error: Some(error.to_string()), ..Default::default() },
            )
            .await
    }

    /// The ingestor calls this once it observes the on-chain
    /// `WithdrawRequested` event following execute success, carrying the
    /// optional Hook CallData.
    pub async fn record_withdraw_requested(&self, id: Uuid, hook: Option<HookCallData>) -> Result<(), DomainError> {
        let Some(hook) = hook else { return Ok(()) };
        self.repo
            .advance_hook_status_if_current(id, HookStatus::NotRequired, HookStatus::Pending)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    hook_intent_type: Some(hook.hook_intent_type),
                    hook_chain_id: Some(hook.hook_chain_id),
                    hook_token_id: Some(hook.hook_token_id),
                    hook_worker_id: Some(hook.hook_worker_id),
                    hook_min_output_amount: hook.hook_min_output_amount,
                    ..Default::default()
                },
            )
            .await
    }

    /// Stage 3: Treasury.payout transaction queued.
    pub async fn queue_payout(&self, id: Uuid, params: PayoutParams) -> Result<(), DomainError> {
        self.repo
            .advance_payout_status_if_current(id, PayoutStatus::Pending, PayoutStatus::Processing)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate {
                    payout_chain_id: Some(params.chain_id),
                    payout_worker_type: Some(params.worker_type),
                    ..Default::default()
                },
            )
            .await?;

        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_PROOF_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::Payout.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::Payout,
                sender_address: params.sender_address,
                chain_id: params.chain_id,
                to_address: params.to_address,
                calldata: params.calldata,
                value: Wei::ZERO,
                withdraw_request_id: Some(id),
                checkbook_id: None,
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_pending_transaction(&tx).await
    }

    /// Stage 3: `Treasury.PayoutExecuted` observed.
    pub async fn payout_completed(&self, id: Uuid, tx_hash: String) -> Result<(), DomainError> {
        self.repo
            .advance_payout_status_if_current(id, PayoutStatus::Processing, PayoutStatus::Completed)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate { payout_tx_hash: Some(tx_hash), ..Default::default() },
            )
            .await
    }

    /// Stage 3: `Treasury.PayoutFailed` observed. By simplified policy this
    /// is terminal — no automatic retry, only an operator-facing record.
    pub async fn payout_failed(&self, id: Uuid, chain_id: u32, attempt: u32, reason: &str) -> Result<(), DomainError> {
        self.repo
            .advance_payout_status_if_current(id, PayoutStatus::Processing, PayoutStatus::Failed)
            .await?;
        self.repo
            .set_withdraw_fields(
                id,
                &WithdrawFieldUpdate { payout_error: Some(reason.to_string()), ..Default::default() },
            )
            .await?;
        self.repo
            .record_payout_retry(&PayoutRetryRecord {
                id: Uuid::new_v4(),
                withdraw_request_id: id,
                chain_id,
                attempt,
                reason: reason.to_string(),
                recorded_at: Utc::now(),
            })
            .await
    }

    /// Stage 4: hook purchase tx queued after payout completion.
    pub async fn queue_hook(&self, id: Uuid, params: HookParams) -> Result<(), DomainError> {
        self.repo
            .advance_hook_status_if_current(id, HookStatus::Pending, HookStatus::Processing)
            .await?;
        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_PROOF_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::Hook.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::Hook,
                sender_address: params.sender_address,
                chain_id: params.chain_id,
                to_address: params.to_address,
                calldata: params.calldata,
                value: Wei::ZERO,
                withdraw_request_id: Some(id),
                checkbook_id: None,
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_pending_transaction(&tx).await
    }

    pub async fn hook_completed(&self, id: Uuid, tx_hash: String) -> Result<(), DomainError> {
        self.repo
            .advance_hook_status_if_current(id, HookStatus::Processing, HookStatus::Completed)
            .await?;
        self.repo
            .set_withdraw_fields(id, &WithdrawFieldUpdate { hook_tx_hash: Some(tx_hash), ..Default::default() })
            .await
    }

    pub async fn hook_failed(&self, id: Uuid, reason: &str) -> Result<(), DomainError> {
        self.repo
            .advance_hook_status_if_current(id, HookStatus::Processing, HookStatus::Failed)
            .await?;
        self.repo
            .set_withdraw_fields(id, &WithdrawFieldUpdate { hook_error: Some(reason.to_string()), ..Default::default() })
            .await
    }

    /// The user gives up on retrying the hook purchase without a fallback
    /// transfer having happened; rollup reports `completed_with_hook_failed`.
    pub async fn abandon_hook(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_hook_status_if_current(id, HookStatus::Failed, HookStatus::Abandoned)
            .await
    }

    /// `Treasury.FallbackTransferred` observed after a hook failure: the
    /// original asset was sent back to the user instead of the hook token.
    pub async fn fallback_transferred(&self, id: Uuid, chain_id: u32, attempt: u32, reason: &str) -> Result<(), DomainError> {
        self.repo
            .set_withdraw_fields(id, &WithdrawFieldUpdate { fallback_transferred: Some(true), ..Default::default() })
            .await?;
        self.repo
            .record_fallback_retry(&FallbackRetryRecord {
                id: Uuid::new_v4(),
                withdraw_request_id: id,
                chain_id,
                attempt,
                reason: reason.to_string(),
                recorded_at: Utc::now(),
            })
            .await
    }

    /// `Treasury.FallbackFailed` observed: the fallback transfer itself
    /// reverted. Mirrors `payout_failed` — no automatic retry, just a
    /// record for the operator, leaving `fallback_transferred` false.
    pub async fn fallback_failed(&self, id: Uuid, chain_id: u32, attempt: u32, reason: &str) -> Result<(), DomainError> {
        self.repo
            .record_fallback_retry(&FallbackRetryRecord {
                id: Uuid::new_v4(),
                withdraw_request_id: id,
                chain_id,
                attempt,
                reason: reason.to_string(),
                recorded_at: Utc::now(),
            })
            .await
    }

    /// Cancellation contract (spec §4.5): cancellable iff
    /// `execute_status ∉ {submitted, success}`; mandatory when
    /// `execute_status = verify_failed`.
    pub async fn cancel(&self, id: Uuid) -> Result<WithdrawRequest, DomainError> {
        let current = self.repo.get_withdraw_request(id).await?;
        if !current.can_cancel() {
            return Err(DomainError::Invalid(format!(
                "withdraw_request {id} cannot be cancelled in execute_status {:?}",
                current.execute_status
            )));
        }
        self.repo.release_allocations(&current.allocation_ids).await?;
        self.repo.mark_user_cancelled(id).await?;
        self.repo.get_withdraw_request(id).await
    }

    /// Applies the pure status rollup to the request's current sub-statuses.
    pub async fn status(&self, id: Uuid) -> Result<WithdrawStatus, DomainError> {
        let w = self.repo.get_withdraw_request(id).await?;
        Ok(rollup_status(
            w.proof_status,
            w.execute_status,
            w.payout_status,
            w.hook_status,
            w.fallback_transferred,
            w.user_cancelled,
            WithdrawStatus::Created,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Allocation, AllocationStatus, Checkbook, CheckbookStatus};
    use crate::db::test_support::InMemoryRepository;

    fn orchestrator() -> (WithdrawOrchestrator, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        (WithdrawOrchestrator::new(repo.clone()), repo)
    }

    async fn seed_checkbook_with_allocations(
        repo: &InMemoryRepository,
        owner: UniversalAddress,
        amounts: &[&str],
    ) -> (Uuid, Vec<Allocation>) {
        let checkbook_id = Uuid::new_v4();
        let checkbook = Checkbook {
            id: checkbook_id,
            slip44_chain_id: owner.chain_id,
            local_deposit_id: "dep-1".into(),
            owner: owner.clone(),
            token_key: "USDT".into(),
            gross_amount: Wei::from_str("100").unwrap(),
            allocatable_amount: Wei::from_str("100").unwrap(),
            fee_total_locked: Wei::ZERO,
            commitment: None,
            status: CheckbookStatus::WithCheckbook,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.create_checkbook_if_not_exists(&checkbook).await.unwrap();

        let mut allocations = Vec::new();
        for (seq, amount) in amounts.iter().enumerate() {
            let a = Allocation {
                id: Uuid::new_v4(),
                checkbook_id,
                seq: seq as u8,
                amount: Wei::from_str(amount).unwrap(),
                status: AllocationStatus::Idle,
                nullifier: None,
                withdraw_request_id: None,
            };
            allocations.push(a);
        }
        repo.insert_allocations(&allocations).await.unwrap();
        (checkbook_id, allocations)
    }

    fn raw_token_command(owner: UniversalAddress, allocation_ids: Vec<Uuid>, amount: Wei) -> CreateWithdrawCommand {
        CreateWithdrawCommand {
            owner: owner.clone(),
            intent: Intent::RawToken {
                beneficiary: UniversalAddress::new(714, [0xBE; 32]),
                token_symbol: "USDT".into(),
            },
            amount,
            allocation_ids,
            max_slippage_bps: None,
            min_output_amount: None,
            payout_deadline: None,
            source_chain_name: None,
            target_chain_name: None,
            source_token_symbol: "USDT".into(),
            signature: "sig".into(),
        }
    }

    fn execute_params() -> ExecuteParams {
        ExecuteParams {
            chain_id: 714,
            sender_address: "0xrelayer".into(),
            to_address: "0xcontract".into(),
            calldata: "0xdeadbeef".into(),
        }
    }

    /// S1 — happy RawToken withdraw on the same chain.
    #[tokio::test]
    async fn s1_happy_raw_token_withdraw_completes() {
        let (orch, repo) = orchestrator();
        let owner = UniversalAddress::new(714, [9; 32]);
        let (_, allocations) = seed_checkbook_with_allocations(&repo, owner.clone(), &["40", "60"]).await;
        let a2 = allocations[1].clone();

        let created = orch
            .create(raw_token_command(owner, vec![a2.id], a2.amount.clone()))
            .await
            .unwrap();

        // A1 untouched, A2 reserved.
        let a1 = repo.get_allocations(&[allocations[0].id]).await.unwrap();
        assert_eq!(a1[0].status, AllocationStatus::Idle);
        let pending = repo.get_allocations(&[a2.id]).await.unwrap();
        assert_eq!(pending[0].status, AllocationStatus::Pending);

        orch.start_proof(created.id).await.unwrap();
        orch.complete_proof(
            created.id,
            &WithdrawProofResult { nullifiers: vec![[7; 32]], commitment_root: [8; 32] },
            execute_params(),
        )
        .await
        .unwrap();
        orch.execute_submitted(created.id, 714, "0xexectx".into()).await.unwrap();
        orch.execute_success(created.id).await.unwrap();
        orch.queue_payout(
            created.id,
            PayoutParams {
                chain_id: 714,
                sender_address: "0xrelayer".into(),
                to_address: "0xtreasury".into(),
                calldata: "0xpayout".into(),
                worker_type: PayoutWorkerType::DirectTransfer,
            },
        )
        .await
        .unwrap();
        orch.payout_completed(created.id, "0xpayouttx".into()).await.unwrap();
        orch.repo.mark_allocations_used(&[(a2.id, [7; 32])]).await.unwrap();

        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::Completed);
        let used = repo.get_allocations(&[a2.id]).await.unwrap();
        assert_eq!(used[0].status, AllocationStatus::Used);
        assert_eq!(used[0].nullifier, Some([7; 32]));
    }

    /// S2 — verify_failed forces cancellation.
    #[tokio::test]
    async fn s2_verify_failed_forces_cancellation() {
        let (orch, repo) = orchestrator();
        let owner = UniversalAddress::new(714, [9; 32]);
        let (_, allocations) = seed_checkbook_with_allocations(&repo, owner.clone(), &["40", "60"]).await;
        let a2 = allocations[1].clone();

        let created = orch
            .create(raw_token_command(owner, vec![a2.id], a2.amount.clone()))
            .await
            .unwrap();
        orch.start_proof(created.id).await.unwrap();
        orch.complete_proof(
            created.id,
            &WithdrawProofResult { nullifiers: vec![[7; 32]], commitment_root: [8; 32] },
            execute_params(),
        )
        .await
        .unwrap();
        orch.execute_submitted(created.id, 714, "0xexectx".into()).await.unwrap();
        orch.execute_verify_failed(created.id, "proof rejected").await.unwrap();

        let w = repo.get_withdraw_request(created.id).await.unwrap();
        assert!(w.must_cancel());
        assert!(!w.can_retry_execute());
        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::FailedPermanent);

        orch.cancel(created.id).await.unwrap();
        let released = repo.get_allocations(&[a2.id]).await.unwrap();
        assert_eq!(released[0].status, AllocationStatus::Idle);
        assert_eq!(released[0].withdraw_request_id, None);
        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::Cancelled);
    }

    /// S3 / S4 — cross-chain AssetToken withdraw with hook, hook fails but
    /// fallback succeeds: final status is `completed`, not
    /// `completed_with_hook_failed` (per the rollup table).
    #[tokio::test]
    async fn s4_hook_fails_fallback_succeeds_is_completed() {
        let (orch, repo) = orchestrator();
        let owner = UniversalAddress::new(714, [9; 32]);
        let (_, allocations) = seed_checkbook_with_allocations(&repo, owner.clone(), &["50"]).await;
        let a1 = allocations[0].clone();

        let cmd = CreateWithdrawCommand {
            owner: owner.clone(),
            intent: Intent::AssetToken {
                asset_id: crate::chain::asset_id::AssetId { chain_id: 60, adapter_id: 1, token_id: 1 }.encode(),
                beneficiary: UniversalAddress::new(60, [0xCA; 32]),
                asset_token_symbol: "aUSDT".into(),
            },
            amount: a1.amount.clone(),
            allocation_ids: vec![a1.id],
            max_slippage_bps: None,
            min_output_amount: None,
            payout_deadline: None,
            source_chain_name: Some("bsc".into()),
            target_chain_name: Some("ethereum".into()),
            source_token_symbol: "USDT".into(),
            signature: "sig".into(),
        };
        let created = orch.create(cmd).await.unwrap();

        orch.start_proof(created.id).await.unwrap();
        orch.complete_proof(
            created.id,
            &WithdrawProofResult { nullifiers: vec![[3; 32]], commitment_root: [4; 32] },
            execute_params(),
        )
        .await
        .unwrap();
        orch.execute_submitted(created.id, 714, "0xexectx".into()).await.unwrap();
        orch.execute_success(created.id).await.unwrap();

        orch.record_withdraw_requested(
            created.id,
            Some(HookCallData {
                hook_intent_type: "asset_token".into(),
                hook_chain_id: 60,
                hook_token_id: "aUSDT".into(),
                hook_worker_id: "worker-1".into(),
                hook_min_output_amount: None,
            }),
        )
        .await
        .unwrap();

        orch.queue_payout(
            created.id,
            PayoutParams {
                chain_id: 714,
                sender_address: "0xrelayer".into(),
                to_address: "0xtreasury".into(),
                calldata: "0xdebridge".into(),
                worker_type: PayoutWorkerType::DeBridgeCrossChain,
            },
        )
        .await
        .unwrap();
        orch.payout_completed(created.id, "0xpayouttx".into()).await.unwrap();
        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::HookProcessing);

        orch.queue_hook(
            created.id,
            HookParams {
                chain_id: 60,
                sender_address: "0xrelayer".into(),
                to_address: "0xhookworker".into(),
                calldata: "0xhookbuy".into(),
            },
        )
        .await
        .unwrap();
        orch.hook_failed(created.id, "slippage exceeded").await.unwrap();
        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::FailedPermanent);

        orch.fallback_transferred(created.id, 60, 1, "hook abandoned, returning source asset").await.unwrap();
        assert_eq!(orch.status(created.id).await.unwrap(), WithdrawStatus::Completed);
    }
}
