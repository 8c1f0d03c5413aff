//! Polling Reconciler (spec §4.8): claims due `polling_tasks` rows with
//! bounded concurrency, asks the scanner for the expected on-chain fact,
//! and either CAS-advances the entity and completes the task, or
//! reschedules/fails it. Same claim-loop idiom as `prover::runner`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::commitment::CommitmentPipeline;
use crate::db::models::{PollKind, PollingTask};
use crate::db::repository::RepositoryPort;
use crate::error::DomainError;
use crate::withdraw::orchestrator::WithdrawOrchestrator;

use super::scanner::ScannerClient;

pub struct PollingReconciler {
    repo: Arc<dyn RepositoryPort>,
    scanner: Arc<ScannerClient>,
    commitment: Arc<CommitmentPipeline>,
    withdraw: Arc<WithdrawOrchestrator>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
}

impl PollingReconciler {
    pub fn new(
        repo: Arc<dyn RepositoryPort>,
        scanner: Arc<ScannerClient>,
        commitment: Arc<CommitmentPipeline>,
        withdraw: Arc<WithdrawOrchestrator>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            scanner,
            commitment,
            withdraw,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            poll_interval,
        }
    }

    /// Rows a crashed worker left `processing` go back to `pending`.
    pub async fn recover_on_startup(&self) -> Result<u64, DomainError> {
        let recovered = self.repo.recover_stuck_processing_rows("polling_tasks").await?;
        if recovered > 0 {
            warn!(recovered, "recovered polling tasks stuck in processing");
        }
        Ok(recovered)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("polling reconciler started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else { continue };
            match self.repo.claim_one_due_polling_task().await {
                Ok(Some(task)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.process(task).await;
                    });
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim polling task"),
            }
        }
        info!("polling reconciler stopped");
    }

    async fn process(&self, task: PollingTask) {
        let result = self.check(&task).await;
        match result {
            Ok(true) => {
                if let Err(e) = self.repo.complete_polling_task(task.id).await {
                    error!(task_id = %task.id, error = %e, "failed to complete polling task");
                }
            }
            Ok(false) => {
                if let Err(e) = self.repo.reschedule_or_fail_polling_task(&task, "expected fact not yet observed").await
                {
                    error!(task_id = %task.id, error = %e, "failed to reschedule polling task");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "polling check failed, rescheduling");
                if let Err(e2) = self.repo.reschedule_or_fail_polling_task(&task, &e.to_string()).await {
                    error!(task_id = %task.id, error = %e2, "failed to reschedule polling task after check error");
                }
            }
        }
    }

    /// Returns `Ok(true)` when the expected fact was observed and the
    /// entity was advanced (or the CAS was already past it — a benign race
    /// with the live NATS path), `Ok(false)` when it's still pending.
    async fn check(&self, task: &PollingTask) -> Result<bool, DomainError> {
        let data = &task.data;
        match data.poll_kind {
            PollKind::DepositRecorded => self.check_deposit_recorded(data.entity_id, data.chain_id).await,
            PollKind::CommitmentRootUpdated => self.check_commitment_root_updated(data.entity_id, data.chain_id).await,
            PollKind::WithdrawRequestedEvent => self.check_withdraw_requested(data.entity_id, data.chain_id).await,
            PollKind::NullifierUsed => self.check_nullifier_used(data.entity_id, data.chain_id).await,
            PollKind::TxReceipt => self.check_tx_receipt(data.entity_id, data.chain_id, &data.expected_fact).await,
        }
    }

    async fn check_deposit_recorded(&self, checkbook_id: uuid::Uuid, chain_id: u32) -> Result<bool, DomainError> {
        let checkbook = self.repo.get_checkbook(checkbook_id).await?;
        let record = self.scanner.deposit(chain_id, &checkbook.local_deposit_id).await?;
        let Some(_record) = record else { return Ok(false) };
        match self.commitment.mark_deposit_recorded(checkbook_id).await {
            Ok(()) | Err(DomainError::Conflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn check_commitment_root_updated(&self, checkbook_id: uuid::Uuid, chain_id: u32) -> Result<bool, DomainError> {
        let checkbook = self.repo.get_checkbook(checkbook_id).await?;
        let Some(commitment) = checkbook.commitment else { return Ok(false) };
        let commitment_hex = format!("0x{}", hex::encode(commitment));
        if !self.scanner.commitment_exists(chain_id, &commitment_hex).await? {
            return Ok(false);
        }
        match self.commitment.record_commitment_root_updated(checkbook_id).await {
            Ok(()) | Err(DomainError::Conflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn check_withdraw_requested(&self, withdraw_id: uuid::Uuid, chain_id: u32) -> Result<bool, DomainError> {
        let withdraw = self.repo.get_withdraw_request(withdraw_id).await?;
        let nullifier_hex = format!("0x{}", hex::encode(withdraw.withdraw_nullifier.unwrap_or([0u8; 32])));
        let found = self
            .scanner
            .find_event(chain_id, "ZKPayProxy", "WithdrawRequested", &format!("nullifier={nullifier_hex}"))
            .await?;
        if found.is_none() {
            return Ok(false);
        }
        match self.withdraw.record_withdraw_requested(withdraw_id, None).await {
            Ok(()) | Err(DomainError::Conflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn check_nullifier_used(&self, withdraw_id: uuid::Uuid, chain_id: u32) -> Result<bool, DomainError> {
        let withdraw = self.repo.get_withdraw_request(withdraw_id).await?;
        let Some(nullifier) = withdraw.withdraw_nullifier else { return Ok(false) };
        let nullifier_hex = format!("0x{}", hex::encode(nullifier));
        if !self.scanner.nullifier_used(chain_id, &nullifier_hex).await? {
            return Ok(false);
        }
        match self.withdraw.record_withdraw_executed(withdraw_id, &[nullifier]).await {
            Ok(()) | Err(DomainError::Conflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn check_tx_receipt(
        &self,
        withdraw_id: uuid::Uuid,
        chain_id: u32,
        expected_fact: &serde_json::Value,
    ) -> Result<bool, DomainError> {
        let tx_hash = expected_fact
            .get("tx_hash")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| DomainError::Invalid("TxReceipt poll task missing tx_hash".into()))?;
        let kind = expected_fact.get("kind").and_then(serde_json::Value::as_str).unwrap_or("");
        let (contract, event) = match kind {
            "payout" => ("Treasury", "PayoutExecuted"),
            "hook" => ("IntentManager", "HookExecuted"),
            "fallback" => ("IntentManager", "FallbackTransferred"),
            _ => return Err(DomainError::Invalid(format!("unknown TxReceipt kind '{kind}'"))),
        };
        let found = self.scanner.find_event(chain_id, contract, event, &format!("txHash={tx_hash}")).await?;
        if found.is_none() {
            return Ok(false);
        }
        let result = match kind {
            "payout" => self.withdraw.payout_completed(withdraw_id, tx_hash.to_string()).await,
            "hook" => self.withdraw.hook_completed(withdraw_id, tx_hash.to_string()).await,
            "fallback" => self.withdraw.fallback_transferred(withdraw_id, chain_id, 1, "confirmed via polling").await,
            _ => unreachable!(),
        };
        match result {
            Ok(()) | Err(DomainError::Conflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}
