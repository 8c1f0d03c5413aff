//! Adapters wiring `CommitmentPipeline` into the proof runner and tx queue
//! as a plain `TxQueueSink` / `CommitmentProofSink`, so neither of those
//! modules needs to know the pipeline exists.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::db::models::{PendingTransaction, PendingTxKind, PollKind};
use crate::error::DomainError;
use crate::notifier::PushNotifier;
use crate::polling::PollingScheduler;
use crate::prover::client::CommitmentProofResponse;
use crate::prover::CommitmentProofSink;
use crate::txqueue::TxQueueSink;

use super::pipeline::{CommitParams, CommitmentPipeline};

pub struct CommitmentTxSink {
    pipeline: Arc<CommitmentPipeline>,
    polling: Arc<PollingScheduler>,
    notifier: Arc<PushNotifier>,
}

impl CommitmentTxSink {
    pub fn new(pipeline: Arc<CommitmentPipeline>, polling: Arc<PollingScheduler>, notifier: Arc<PushNotifier>) -> Self {
        Self { pipeline, polling, notifier }
    }

    fn checkbook_id(tx: &PendingTransaction) -> Option<uuid::Uuid> {
        tx.task_data.checkbook_id
    }
}

#[async_trait::async_trait]
impl TxQueueSink for CommitmentTxSink {
    async fn on_submitted(&self, tx: &PendingTransaction, _tx_hash: &str) {
        let Some(id) = Self::checkbook_id(tx) else { return };
        if let Err(e) = self.pipeline.mark_commitment_submitted(id).await {
            warn!(checkbook_id = %id, error = %e, "mark_commitment_submitted failed");
        }
    }

    /// The checkbook only advances to `with_checkbook` once the ingestor
    /// observes `CommitmentRootUpdated` (spec §4.4) — a confirmed receipt
    /// on its own is not that signal, so it schedules the polling
    /// fallback in case that event never shows up.
    async fn on_confirmed(&self, tx: &PendingTransaction, tx_hash: &str) {
        let Some(id) = Self::checkbook_id(tx) else { return };
        info!(checkbook_id = %id, tx_hash, "commitment submission confirmed, awaiting CommitmentRootUpdated");
        if let Err(e) = self
            .polling
            .schedule(PollKind::CommitmentRootUpdated, id, tx.task_data.chain_id, serde_json::json!({}))
            .await
        {
            warn!(checkbook_id = %id, error = %e, "failed to schedule CommitmentRootUpdated poll");
        }
    }

    async fn on_reverted(&self, tx: &PendingTransaction, reason: &str) {
        let Some(id) = Self::checkbook_id(tx) else { return };
        if let Err(e) = self.pipeline.fail_submission(id, reason).await {
            warn!(checkbook_id = %id, error = %e, "fail_submission failed");
        }
        self.notifier.notify_checkbook(id, "failed", Some(reason.to_string()));
    }

    async fn on_submission_exhausted(&self, tx: &PendingTransaction, reason: &str) {
        let Some(id) = Self::checkbook_id(tx) else { return };
        if let Err(e) = self.pipeline.fail_submission(id, reason).await {
            warn!(checkbook_id = %id, error = %e, "fail_submission failed");
        }
        self.notifier.notify_checkbook(id, "failed", Some(reason.to_string()));
    }
}

/// Adapts the external prover's commitment-proof response into the
/// pipeline's `complete_proof`/`fail_proof` calls.
pub struct CommitmentProofTaskSink {
    pipeline: Arc<CommitmentPipeline>,
    relayer_operator_address: String,
    protocol_contract_addresses: HashMap<u32, String>,
    notifier: Arc<PushNotifier>,
}

impl CommitmentProofTaskSink {
    pub fn new(
        pipeline: Arc<CommitmentPipeline>,
        relayer_operator_address: String,
        protocol_contract_addresses: HashMap<u32, String>,
        notifier: Arc<PushNotifier>,
    ) -> Self {
        Self { pipeline, relayer_operator_address, protocol_contract_addresses, notifier }
    }

    fn contract_for(&self, chain_id: u32) -> Result<String, DomainError> {
        self.protocol_contract_addresses
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| DomainError::Fatal(format!("no protocol contract address configured for chain {chain_id}")))
    }
}

#[async_trait::async_trait]
impl CommitmentProofSink for CommitmentProofTaskSink {
    async fn on_success(&self, checkbook_id: uuid::Uuid, response: CommitmentProofResponse) {
        let to_address = match self.contract_for(response.owner_chain_id) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(checkbook_id = %checkbook_id, error = %e, "no submission-chain contract configured");
                let _ = self.pipeline.fail_proof(checkbook_id, &e.to_string()).await;
                return;
            }
        };
        let submit = CommitParams {
            chain_id: response.owner_chain_id,
            sender_address: self.relayer_operator_address.clone(),
            to_address,
            calldata: build_commitment_calldata(&response.proof_data, &response.public_values),
        };
        let allocations_count = response.allocations_count;
        if let Err(e) = self
            .pipeline
            .complete_proof(checkbook_id, &response.proof_data, &response.public_values, allocations_count, submit)
            .await
        {
            warn!(checkbook_id = %checkbook_id, error = %e, "complete_proof failed");
        }
    }

    async fn on_failure(&self, checkbook_id: uuid::Uuid, reason: &str, exhausted: bool) {
        if !exhausted {
            return;
        }
        if let Err(e) = self.pipeline.fail_proof(checkbook_id, reason).await {
            warn!(checkbook_id = %checkbook_id, error = %e, "fail_proof failed");
        }
        self.notifier.notify_checkbook(checkbook_id, "failed", Some(reason.to_string()));
    }
}

fn build_commitment_calldata(proof_data: &str, public_values: &str) -> String {
    let proof = proof_data.strip_prefix("0x").unwrap_or(proof_data);
    let public = public_values.strip_prefix("0x").unwrap_or(public_values);
    format!("0x{proof}{public}")
}
