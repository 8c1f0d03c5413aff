//! Commitment Pipeline (spec §4.4): the Checkbook state machine from a
//! recorded deposit through allocation planning, ZK commitment proof, and
//! on-chain submission/confirmation.
//!
//! Like `WithdrawOrchestrator`, this module owns no collaborators: callers
//! in `commitment::sinks` translate prover/tx-queue/ingestor callbacks into
//! these methods.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::chain::address::UniversalAddress;
use crate::db::models::{
    Allocation, AllocationStatus, Checkbook, CheckbookStatus, PendingTransactionData, PendingTxKind,
    ProofGenerationTaskData, TaskRow, TaskStatus, Wei,
};
use crate::db::repository::RepositoryPort;
use crate::error::DomainError;

use super::plan::build_allocation_plan;

const PROOF_TASK_MAX_RETRIES: u32 = 5;

pub struct CommitmentPipeline {
    repo: Arc<dyn RepositoryPort>,
}

/// What the ingestor hands over once a deposit is first recorded locally
/// (spec §4.4: the `pending` checkbook row predates the on-chain
/// `DepositReceived` event that confirms it).
#[derive(Debug, Clone)]
pub struct RecordDepositCommand {
    pub slip44_chain_id: u32,
    pub local_deposit_id: String,
    pub owner: UniversalAddress,
    pub token_key: String,
    pub gross_amount: Wei,
    pub allocatable_amount: Wei,
    pub fee_total_locked: Wei,
}

/// What a client submits to split `allocatable_amount` into spendable
/// allocations (spec §4.4's allocation plan contract).
#[derive(Debug, Clone)]
pub struct RequestAllocationPlanCommand {
    pub checkbook_id: Uuid,
    pub requested_amounts: Vec<Wei>,
    pub signature: String,
    pub language: String,
}

/// Tx material for the commitment-submission call, already built and
/// signed by the tx queue's collaborators.
#[derive(Debug, Clone)]
pub struct CommitParams {
    pub chain_id: u32,
    pub sender_address: String,
    pub to_address: String,
    pub calldata: String,
}

impl CommitmentPipeline {
    pub fn new(repo: Arc<dyn RepositoryPort>) -> Self {
        Self { repo }
    }

    /// Idempotent on `(slip44_chain_id, local_deposit_id)` — a re-delivered
    /// deposit event is safe to record twice.
    pub async fn record_deposit(&self, cmd: RecordDepositCommand) -> Result<Checkbook, DomainError> {
        let new = Checkbook {
            id: Uuid::new_v4(),
            slip44_chain_id: cmd.slip44_chain_id,
            local_deposit_id: cmd.local_deposit_id,
            owner: cmd.owner,
            token_key: cmd.token_key,
            gross_amount: cmd.gross_amount,
            allocatable_amount: cmd.allocatable_amount,
            fee_total_locked: cmd.fee_total_locked,
            commitment: None,
            status: CheckbookStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.repo.create_checkbook_if_not_exists(&new).await
    }

    /// `Treasury.DepositReceived` observed.
    pub async fn mark_deposit_received(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::Pending, CheckbookStatus::Unsigned)
            .await
    }

    /// `ZKPayProxy.DepositRecorded` observed.
    pub async fn mark_deposit_recorded(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::Unsigned, CheckbookStatus::ReadyForCommitment)
            .await
    }

    /// Builds the allocation plan, inserts the `pending` allocation rows,
    /// and enqueues the commitment proof task.
    pub async fn request_allocation_plan(&self, cmd: RequestAllocationPlanCommand) -> Result<(), DomainError> {
        let checkbook = self.repo.get_checkbook(cmd.checkbook_id).await?;
        self.repo
            .advance_checkbook_status_if_current(
                cmd.checkbook_id,
                CheckbookStatus::ReadyForCommitment,
                CheckbookStatus::GeneratingProof,
            )
            .await?;

        let plan = build_allocation_plan(checkbook.allocatable_amount, &cmd.requested_amounts)?;
        let allocations: Vec<Allocation> = plan
            .iter()
            .enumerate()
            .map(|(seq, amount)| Allocation {
                id: Uuid::new_v4(),
                checkbook_id: cmd.checkbook_id,
                seq: seq as u8,
                amount: *amount,
                status: AllocationStatus::Pending,
                nullifier: None,
                withdraw_request_id: None,
            })
            .collect();
        self.repo.insert_allocations(&allocations).await?;

        let task = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: PROOF_TASK_MAX_RETRIES,
            next_retry_at: None,
            priority: 0,
            task_data: ProofGenerationTaskData {
                checkbook_id: cmd.checkbook_id,
                allocations: allocations.iter().map(|a| (a.seq, a.amount)).collect(),
                deposit_id: checkbook.local_deposit_id,
                owner: checkbook.owner,
                token_key: checkbook.token_key,
                language: cmd.language,
                signature: cmd.signature,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_proof_generation_task(&task).await
    }

    /// Proof success: verifies the prover's allocation count, stores the
    /// derived commitment, and enqueues the commitment-submission tx.
    pub async fn complete_proof(
        &self,
        id: Uuid,
        proof_data: &str,
        public_values: &str,
        allocations_count: u32,
        submit: CommitParams,
    ) -> Result<(), DomainError> {
        let allocations = self.repo.list_allocations_for_checkbook(id).await?;
        let pending_count = allocations.iter().filter(|a| a.status == AllocationStatus::Pending).count() as u32;
        if pending_count != allocations_count {
            return Err(DomainError::Invalid(format!(
                "prover reported {allocations_count} allocations, checkbook {id} has {pending_count} pending"
            )));
        }

        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::GeneratingProof, CheckbookStatus::SubmittingCommitment)
            .await?;
        self.repo.set_checkbook_commitment(id, commitment_digest(proof_data, public_values)).await?;

        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: PROOF_TASK_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::Commitment.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::Commitment,
                sender_address: submit.sender_address,
                chain_id: submit.chain_id,
                to_address: submit.to_address,
                calldata: submit.calldata,
                value: Wei::ZERO,
                withdraw_request_id: None,
                checkbook_id: Some(id),
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_pending_transaction(&tx).await
    }

    /// Proof task exhausted its retries. No automatic retry at the
    /// checkbook level (spec §4.4: "terminal-for-automation but
    /// operator-retriable") — only `retry_proof_failed` re-enters
    /// `generating_proof`.
    pub async fn fail_proof(&self, id: Uuid, reason: &str) -> Result<(), DomainError> {
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::GeneratingProof, CheckbookStatus::ProofFailed)
            .await
            .map_err(|e| {
                tracing::warn!(checkbook_id = %id, reason, "commitment proof failed: {e}");
                e
            })
    }

    /// Operator action: re-enters `generating_proof` with a fresh proof
    /// task over the checkbook's existing pending allocations.
    pub async fn retry_proof_failed(&self, id: Uuid, signature: String, language: String) -> Result<(), DomainError> {
        let checkbook = self.repo.get_checkbook(id).await?;
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::ProofFailed, CheckbookStatus::GeneratingProof)
            .await?;
        let allocations = self.repo.list_allocations_for_checkbook(id).await?;
        let task = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: PROOF_TASK_MAX_RETRIES,
            next_retry_at: None,
            priority: 0,
            task_data: ProofGenerationTaskData {
                checkbook_id: id,
                allocations: allocations
                    .iter()
                    .filter(|a| a.status == AllocationStatus::Pending)
                    .map(|a| (a.seq, a.amount))
                    .collect(),
                deposit_id: checkbook.local_deposit_id,
                owner: checkbook.owner,
                token_key: checkbook.token_key,
                language,
                signature,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_proof_generation_task(&task).await
    }

    /// Commitment-submission tx reverted or its submission retries were
    /// exhausted.
    pub async fn fail_submission(&self, id: Uuid, reason: &str) -> Result<(), DomainError> {
        tracing::warn!(checkbook_id = %id, reason, "commitment submission failed");
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::SubmittingCommitment, CheckbookStatus::SubmissionFailed)
            .await
    }

    /// Operator action: re-enters `submitting_commitment`, reusing the
    /// proof already stored on the checkbook, with a fresh queued tx.
    pub async fn retry_submission_failed(&self, id: Uuid, submit: CommitParams) -> Result<(), DomainError> {
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::SubmissionFailed, CheckbookStatus::SubmittingCommitment)
            .await?;
        let tx = TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: PROOF_TASK_MAX_RETRIES,
            next_retry_at: None,
            priority: PendingTxKind::Commitment.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::Commitment,
                sender_address: submit.sender_address,
                chain_id: submit.chain_id,
                to_address: submit.to_address,
                calldata: submit.calldata,
                value: Wei::ZERO,
                withdraw_request_id: None,
                checkbook_id: Some(id),
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.repo.insert_pending_transaction(&tx).await
    }

    /// Commitment-submission tx accepted by the chain's mempool.
    pub async fn mark_commitment_submitted(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::SubmittingCommitment, CheckbookStatus::CommitmentPending)
            .await
    }

    /// `CommitmentRootUpdated` observed: derives and stores each pending
    /// allocation's nullifier and flips them pending→idle (spendable).
    pub async fn record_commitment_root_updated(&self, id: Uuid) -> Result<(), DomainError> {
        let checkbook = self.repo.get_checkbook(id).await?;
        let commitment = checkbook
            .commitment
            .ok_or_else(|| DomainError::Fatal(format!("checkbook {id} has no commitment to derive nullifiers from")))?;

        let allocations = self.repo.list_allocations_for_checkbook(id).await?;
        let pairs: Vec<(Uuid, [u8; 32])> = allocations
            .iter()
            .filter(|a| a.status == AllocationStatus::Pending)
            .map(|a| (a.id, derive_allocation_nullifier(commitment, a.seq)))
            .collect();
        self.repo.mark_allocations_idle_with_nullifiers(&pairs).await?;

        self.repo
            .advance_checkbook_status_if_current(id, CheckbookStatus::CommitmentPending, CheckbookStatus::WithCheckbook)
            .await
    }
}

/// The wire contract's commitment proof response carries no `commitment`
/// field (spec §6 lists only proof_data/public_values/vkey/allocations_count
/// for `/api/proof/commitment`, though §4.4's prose also names `commitment`)
/// — derived here as a digest over the proof material instead of trusting
/// an absent field.
fn commitment_digest(proof_data: &str, public_values: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(proof_data.as_bytes());
    hasher.update(public_values.as_bytes());
    hasher.finalize().into()
}

fn derive_allocation_nullifier(commitment: [u8; 32], seq: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(commitment);
    hasher.update([seq]);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::InMemoryRepository;

    fn pipeline() -> (CommitmentPipeline, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        (CommitmentPipeline::new(repo.clone()), repo)
    }

    fn deposit_command(owner: UniversalAddress) -> RecordDepositCommand {
        RecordDepositCommand {
            slip44_chain_id: owner.chain_id,
            local_deposit_id: "dep-1".into(),
            owner,
            token_key: "USDT".into(),
            gross_amount: Wei::from_str("100").unwrap(),
            allocatable_amount: Wei::from_str("100").unwrap(),
            fee_total_locked: Wei::ZERO,
        }
    }

    fn commit_params() -> CommitParams {
        CommitParams {
            chain_id: 714,
            sender_address: "0xrelayer".into(),
            to_address: "0xcheckbook".into(),
            calldata: "0xdeadbeef".into(),
        }
    }

    /// Happy path through the full Checkbook state machine.
    #[tokio::test]
    async fn full_lifecycle_reaches_with_checkbook() {
        let (pipe, repo) = pipeline();
        let owner = UniversalAddress::new(714, [9; 32]);

        let created = pipe.record_deposit(deposit_command(owner)).await.unwrap();
        assert_eq!(created.status, CheckbookStatus::Pending);

        pipe.mark_deposit_received(created.id).await.unwrap();
        pipe.mark_deposit_recorded(created.id).await.unwrap();

        pipe.request_allocation_plan(RequestAllocationPlanCommand {
            checkbook_id: created.id,
            requested_amounts: vec![Wei::from_str("40").unwrap(), Wei::from_str("60").unwrap()],
            signature: "sig".into(),
            language: "en".into(),
        })
        .await
        .unwrap();

        let allocations = repo.list_allocations_for_checkbook(created.id).await.unwrap();
        assert_eq!(allocations.len(), 2);
        assert!(allocations.iter().all(|a| a.status == AllocationStatus::Pending));

        pipe.complete_proof(created.id, "0xproof", "0xpublic", 2, commit_params()).await.unwrap();
        let after_proof = repo.get_checkbook(created.id).await.unwrap();
        assert_eq!(after_proof.status, CheckbookStatus::SubmittingCommitment);
        assert!(after_proof.commitment.is_some());

        pipe.mark_commitment_submitted(created.id).await.unwrap();
        pipe.record_commitment_root_updated(created.id).await.unwrap();

        let finished = repo.get_checkbook(created.id).await.unwrap();
        assert_eq!(finished.status, CheckbookStatus::WithCheckbook);
        let settled = repo.list_allocations_for_checkbook(created.id).await.unwrap();
        assert!(settled.iter().all(|a| a.status == AllocationStatus::Idle));
        assert!(settled.iter().all(|a| a.nullifier.is_some()));
    }

    #[tokio::test]
    async fn complete_proof_rejects_mismatched_allocation_count() {
        let (pipe, _repo) = pipeline();
        let owner = UniversalAddress::new(714, [9; 32]);
        let created = pipe.record_deposit(deposit_command(owner)).await.unwrap();
        pipe.mark_deposit_received(created.id).await.unwrap();
        pipe.mark_deposit_recorded(created.id).await.unwrap();
        pipe.request_allocation_plan(RequestAllocationPlanCommand {
            checkbook_id: created.id,
            requested_amounts: vec![Wei::from_str("100").unwrap()],
            signature: "sig".into(),
            language: "en".into(),
        })
        .await
        .unwrap();

        let err = pipe.complete_proof(created.id, "0xproof", "0xpublic", 2, commit_params()).await.unwrap_err();
        assert!(matches!(err, DomainError::Invalid(_)));
    }

    /// proof_failed -> generating_proof via operator retry, then happy path.
    #[tokio::test]
    async fn retry_proof_failed_reenters_generating_proof() {
        let (pipe, repo) = pipeline();
        let owner = UniversalAddress::new(714, [9; 32]);
        let created = pipe.record_deposit(deposit_command(owner)).await.unwrap();
        pipe.mark_deposit_received(created.id).await.unwrap();
        pipe.mark_deposit_recorded(created.id).await.unwrap();
        pipe.request_allocation_plan(RequestAllocationPlanCommand {
            checkbook_id: created.id,
            requested_amounts: vec![Wei::from_str("100").unwrap()],
            signature: "sig".into(),
            language: "en".into(),
        })
        .await
        .unwrap();

        pipe.fail_proof(created.id, "prover timeout").await.unwrap();
        assert_eq!(repo.get_checkbook(created.id).await.unwrap().status, CheckbookStatus::ProofFailed);

        pipe.retry_proof_failed(created.id, "sig2".into(), "en".into()).await.unwrap();
        assert_eq!(repo.get_checkbook(created.id).await.unwrap().status, CheckbookStatus::GeneratingProof);

        pipe.complete_proof(created.id, "0xproof", "0xpublic", 1, commit_params()).await.unwrap();
        assert_eq!(repo.get_checkbook(created.id).await.unwrap().status, CheckbookStatus::SubmittingCommitment);
    }

    /// submission_failed -> submitting_commitment via operator retry.
    #[tokio::test]
    async fn retry_submission_failed_reenters_submitting_commitment() {
        let (pipe, repo) = pipeline();
        let owner = UniversalAddress::new(714, [9; 32]);
        let created = pipe.record_deposit(deposit_command(owner)).await.unwrap();
        pipe.mark_deposit_received(created.id).await.unwrap();
        pipe.mark_deposit_recorded(created.id).await.unwrap();
        pipe.request_allocation_plan(RequestAllocationPlanCommand {
            checkbook_id: created.id,
            requested_amounts: vec![Wei::from_str("100").unwrap()],
            signature: "sig".into(),
            language: "en".into(),
        })
        .await
        .unwrap();
        pipe.complete_proof(created.id, "0xproof", "0xpublic", 1, commit_params()).await.unwrap();

        pipe.fail_submission(created.id, "rpc error").await.unwrap();
        assert_eq!(repo.get_checkbook(created.id).await.unwrap().status, CheckbookStatus::SubmissionFailed);

        pipe.retry_submission_failed(created.id, commit_params()).await.unwrap();
        assert_eq!(repo.get_checkbook(created.id).await.unwrap().status, CheckbookStatus::SubmittingCommitment);
    }

    #[test]
    fn commitment_digest_is_deterministic_and_order_sensitive() {
        let a = commitment_digest("0xaa", "0xbb");
        let b = commitment_digest("0xaa", "0xbb");
        let c = commitment_digest("0xbb", "0xaa");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
