//! Proof Task Runner (spec §4.7): two independently-bounded worker pools
//! claim due rows from `proof_generation_tasks` and
//! `withdraw_proof_generation_tasks`, call the external prover, and hand
//! the result to whichever sink the caller wired up (commitment pipeline /
//! withdraw orchestrator), without knowing either one directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::models::{ProofGenerationTask, WithdrawProofGenerationTask};
use crate::db::repository::RepositoryPort;
use crate::error::{backoff_after, DomainError, Retryable};
use crate::withdraw::intent::to_prover_intent;

use super::client::{
    AllocationHex, BuildCommitmentRequest, CommitmentGroupWire, CommitmentProofResponse, ProverClient,
    WithdrawProofRequest, WithdrawProofResponse,
};

const COMMITMENT_TASKS_TABLE: &str = "proof_generation_tasks";
const WITHDRAW_TASKS_TABLE: &str = "withdraw_proof_generation_tasks";
const PROOF_LANG: &str = "en";

#[async_trait::async_trait]
pub trait CommitmentProofSink: Send + Sync {
    async fn on_success(&self, checkbook_id: Uuid, response: CommitmentProofResponse);
    async fn on_failure(&self, checkbook_id: Uuid, reason: &str, exhausted: bool);
}

#[async_trait::async_trait]
pub trait WithdrawProofSink: Send + Sync {
    async fn on_success(&self, withdraw_request_id: Uuid, response: WithdrawProofResponse);
    async fn on_failure(&self, withdraw_request_id: Uuid, reason: &str, exhausted: bool);
}

/// Renders an integer wei amount as a left-padded 32-byte hex string, the
/// wire form the prover's `amount_hex32` fields expect.
fn amount_to_hex32(amount: crate::db::models::Wei) -> String {
    let as_u128: u128 = amount.0.trunc().to_string().parse().unwrap_or(0);
    let mut buf = [0u8; 32];
    buf[16..].copy_from_slice(&as_u128.to_be_bytes());
    format!("0x{}", hex::encode(buf))
}

pub struct ProofTaskRunner {
    repo: Arc<dyn RepositoryPort>,
    client: Arc<ProverClient>,
    commitment_sink: Arc<dyn CommitmentProofSink>,
    withdraw_sink: Arc<dyn WithdrawProofSink>,
    commitment_semaphore: Arc<Semaphore>,
    withdraw_semaphore: Arc<Semaphore>,
    max_retries: u32,
    poll_interval: Duration,
}

impl ProofTaskRunner {
    pub fn new(
        repo: Arc<dyn RepositoryPort>,
        client: Arc<ProverClient>,
        commitment_sink: Arc<dyn CommitmentProofSink>,
        withdraw_sink: Arc<dyn WithdrawProofSink>,
        commitment_concurrency: usize,
        withdraw_concurrency: usize,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            client,
            commitment_sink,
            withdraw_sink,
            commitment_semaphore: Arc::new(Semaphore::new(commitment_concurrency.max(1))),
            withdraw_semaphore: Arc::new(Semaphore::new(withdraw_concurrency.max(1))),
            max_retries,
            poll_interval,
        }
    }

    /// Rows a crashed worker left `processing` go back to `pending` (spec
    /// §4.7 recovery rule), for both task tables.
    pub async fn recover_on_startup(&self) -> Result<(u64, u64), DomainError> {
        let commitment = self.repo.recover_stuck_processing_rows(COMMITMENT_TASKS_TABLE).await?;
        let withdraw = self.repo.recover_stuck_processing_rows(WITHDRAW_TASKS_TABLE).await?;
        if commitment > 0 || withdraw > 0 {
            warn!(commitment, withdraw, "recovered proof tasks stuck in processing");
        }
        Ok((commitment, withdraw))
    }

    pub async fn run_commitment_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("commitment proof runner started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Ok(permit) = self.commitment_semaphore.clone().try_acquire_owned() else {
                continue;
            };
            match self.repo.claim_one_pending_proof_task().await {
                Ok(Some(task)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.process_commitment_task(task).await {
                            error!(error = %e, "commitment proof task processing failed");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim commitment proof task"),
            }
        }
        info!("commitment proof runner stopped");
    }

    pub async fn run_withdraw_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("withdraw proof runner started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Ok(permit) = self.withdraw_semaphore.clone().try_acquire_owned() else {
                continue;
            };
            match self.repo.claim_one_pending_withdraw_proof_task().await {
                Ok(Some(task)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.process_withdraw_task(task).await {
                            error!(error = %e, "withdraw proof task processing failed");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim withdraw proof task"),
            }
        }
        info!("withdraw proof runner stopped");
    }

    async fn process_commitment_task(&self, task: ProofGenerationTask) -> Result<(), DomainError> {
        let data = &task.task_data;
        let req = BuildCommitmentRequest {
            allocations: data
                .allocations
                .iter()
                .map(|(seq, amount)| AllocationHex { seq: *seq, amount_hex32: amount_to_hex32(*amount) })
                .collect(),
            deposit_id: data.deposit_id.clone(),
            signature: data.signature.clone(),
            owner_address: data.owner.to_hex(),
            token_key: data.token_key.clone(),
            chain_name: None,
            lang: data.language.clone(),
        };
        match self.client.build_commitment(&req).await {
            Ok(resp) if resp.success => {
                self.repo.complete_task(COMMITMENT_TASKS_TABLE, task.id).await?;
                self.commitment_sink.on_success(data.checkbook_id, resp).await;
                Ok(())
            }
            Ok(resp) => {
                let reason = resp.error_message.unwrap_or_else(|| "prover rejected commitment".into());
                self.fail_commitment(&task, &reason, false).await
            }
            Err(e) => self.fail_commitment(&task, &e.to_string(), e.is_retryable()).await,
        }
    }

    async fn fail_commitment(&self, task: &ProofGenerationTask, reason: &str, retryable: bool) -> Result<(), DomainError> {
        let exhausted = !retryable || task.retry_count >= self.max_retries;
        let next_retry_at = (!exhausted)
            .then(|| chrono::Utc::now() + chrono::Duration::from_std(backoff_after(task.retry_count)).unwrap());
        self.repo.fail_task(COMMITMENT_TASKS_TABLE, task.id, reason, next_retry_at).await?;
        self.commitment_sink.on_failure(task.task_data.checkbook_id, reason, exhausted).await;
        Ok(())
    }

    async fn process_withdraw_task(&self, task: WithdrawProofGenerationTask) -> Result<(), DomainError> {
        let data = &task.task_data;
        let intent = match to_prover_intent(&data.intent) {
            Ok(i) => i,
            Err(e) => return self.fail_withdraw(&task, &e.to_string(), false).await,
        };
        let req = WithdrawProofRequest {
            commitment_groups: data
                .commitment_groups
                .iter()
                .map(|g| CommitmentGroupWire {
                    checkbook_id: g.checkbook_id.to_string(),
                    allocations: g
                        .allocations
                        .iter()
                        .map(|(seq, amount)| AllocationHex { seq: *seq, amount_hex32: amount_to_hex32(*amount) })
                        .collect(),
                })
                .collect(),
            owner_address: data.owner.to_hex(),
            intent,
            signature: data.signature.clone(),
            source_token_symbol: data.source_token_symbol.clone(),
            lang: PROOF_LANG.into(),
            source_chain_name: data.source_chain_name.clone(),
            target_chain_name: data.target_chain_name.clone(),
            min_output: data.min_output.map(|w| w.0.to_string()),
        };
        match self.client.build_withdraw_proof(&req).await {
            Ok(resp) if resp.success => {
                self.repo.complete_task(WITHDRAW_TASKS_TABLE, task.id).await?;
                self.withdraw_sink.on_success(data.withdraw_request_id, resp).await;
                Ok(())
            }
            Ok(resp) => {
                let reason = resp.error_message.unwrap_or_else(|| "prover rejected withdraw proof".into());
                self.fail_withdraw(&task, &reason, false).await
            }
            Err(e) => self.fail_withdraw(&task, &e.to_string(), e.is_retryable()).await,
        }
    }

    async fn fail_withdraw(
        &self,
        task: &WithdrawProofGenerationTask,
        reason: &str,
        retryable: bool,
    ) -> Result<(), DomainError> {
        let exhausted = !retryable || task.retry_count >= self.max_retries;
        let next_retry_at = (!exhausted)
            .then(|| chrono::Utc::now() + chrono::Duration::from_std(backoff_after(task.retry_count)).unwrap());
        self.repo.fail_task(WITHDRAW_TASKS_TABLE, task.id, reason, next_retry_at).await?;
        self.withdraw_sink.on_failure(task.task_data.withdraw_request_id, reason, exhausted).await;
        Ok(())
    }
}
