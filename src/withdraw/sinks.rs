//! Adapters wiring `WithdrawOrchestrator` into the proof runner and tx
//! queue as a plain `TxQueueSink` / `WithdrawProofSink`, so neither of
//! those modules needs to know the orchestrator exists.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::db::models::{PendingTransaction, PendingTxKind, PollKind};
use crate::error::DomainError;
use crate::notifier::PushNotifier;
use crate::polling::PollingScheduler;
use crate::prover::client::WithdrawProofResponse;
use crate::prover::WithdrawProofSink;
use crate::txqueue::TxQueueSink;

use super::orchestrator::{ExecuteParams, WithdrawOrchestrator, WithdrawProofResult};

/// The relayer's own operator address, supplied by the tx queue's config
/// (spec §1: signing is external, but the relayer still names the `from`).
pub struct WithdrawTxSink {
    orchestrator: Arc<WithdrawOrchestrator>,
    polling: Arc<PollingScheduler>,
    notifier: Arc<PushNotifier>,
}

impl WithdrawTxSink {
    pub fn new(orchestrator: Arc<WithdrawOrchestrator>, polling: Arc<PollingScheduler>, notifier: Arc<PushNotifier>) -> Self {
        Self { orchestrator, polling, notifier }
    }

    fn withdraw_id(tx: &PendingTransaction) -> Option<uuid::Uuid> {
        tx.task_data.withdraw_request_id
    }

    /// Payout/hook/fallback confirmations are driven directly by the tx
    /// queue's own receipt detection above; this schedules the same
    /// `TxReceipt` poll type as a safety net in case the worker observing
    /// that confirmation crashes before it lands (spec §4.8).
    async fn schedule_tx_receipt(&self, id: uuid::Uuid, chain_id: u32, tx_hash: &str, kind: &str) {
        if let Err(e) = self
            .polling
            .schedule(PollKind::TxReceipt, id, chain_id, serde_json::json!({"tx_hash": tx_hash, "kind": kind}))
            .await
        {
            warn!(withdraw_request_id = %id, error = %e, "failed to schedule TxReceipt poll");
        }
    }

    /// Once the execute tx confirms, the chain is expected to emit
    /// `WithdrawRequested` (spec: "following execute success") and
    /// eventually mark the nullifier used — both covered here in case the
    /// corresponding NATS events never arrive.
    async fn schedule_execute_followups(&self, id: uuid::Uuid, chain_id: u32) {
        if let Err(e) = self.polling.schedule(PollKind::WithdrawRequestedEvent, id, chain_id, serde_json::json!({})).await
        {
            warn!(withdraw_request_id = %id, error = %e, "failed to schedule WithdrawRequestedEvent poll");
        }
        if let Err(e) = self.polling.schedule(PollKind::NullifierUsed, id, chain_id, serde_json::json!({})).await {
            warn!(withdraw_request_id = %id, error = %e, "failed to schedule NullifierUsed poll");
        }
    }
}

#[async_trait::async_trait]
impl TxQueueSink for WithdrawTxSink {
    async fn on_submitted(&self, tx: &PendingTransaction, tx_hash: &str) {
        let Some(id) = Self::withdraw_id(tx) else { return };
        match tx.task_data.kind {
            PendingTxKind::WithdrawExecute => {
                if let Err(e) = self.orchestrator.execute_submitted(id, tx.task_data.chain_id, tx_hash.to_string()).await
                {
                    warn!(withdraw_request_id = %id, error = %e, "execute_submitted failed");
                }
            }
            PendingTxKind::Payout => self.schedule_tx_receipt(id, tx.task_data.chain_id, tx_hash, "payout").await,
            PendingTxKind::Hook => self.schedule_tx_receipt(id, tx.task_data.chain_id, tx_hash, "hook").await,
            PendingTxKind::Fallback => self.schedule_tx_receipt(id, tx.task_data.chain_id, tx_hash, "fallback").await,
            PendingTxKind::Commitment => {}
        }
    }

    async fn on_confirmed(&self, tx: &PendingTransaction, tx_hash: &str) {
        let Some(id) = Self::withdraw_id(tx) else { return };
        let (result, status) = match tx.task_data.kind {
            PendingTxKind::WithdrawExecute => {
                let outcome = self.orchestrator.execute_success(id).await;
                if outcome.is_ok() {
                    self.schedule_execute_followups(id, tx.task_data.chain_id).await;
                }
                (outcome, "executed")
            }
            PendingTxKind::Payout => (self.orchestrator.payout_completed(id, tx_hash.to_string()).await, "payout_completed"),
            PendingTxKind::Hook => (self.orchestrator.hook_completed(id, tx_hash.to_string()).await, "hook_completed"),
            PendingTxKind::Fallback => (
                self.orchestrator.fallback_transferred(id, tx.task_data.chain_id, 1, "fallback transfer confirmed").await,
                "fallback_transferred",
            ),
            PendingTxKind::Commitment => return,
        };
        match result {
            Ok(()) => self.notifier.notify_withdraw(id, status, None),
            Err(e) => warn!(withdraw_request_id = %id, tx_hash, error = %e, "on_confirmed dispatch failed"),
        }
    }

    async fn on_reverted(&self, tx: &PendingTransaction, reason: &str) {
        let Some(id) = Self::withdraw_id(tx) else { return };
        let result = match tx.task_data.kind {
            PendingTxKind::WithdrawExecute => self.orchestrator.execute_verify_failed(id, reason).await,
            PendingTxKind::Payout => self.orchestrator.payout_failed(id, tx.task_data.chain_id, 1, reason).await,
            PendingTxKind::Hook => self.orchestrator.hook_failed(id, reason).await,
            PendingTxKind::Fallback => {
                warn!(withdraw_request_id = %id, reason, "fallback transfer reverted, no automatic retry");
                Ok(())
            }
            PendingTxKind::Commitment => return,
        };
        if let Err(e) = result {
            warn!(withdraw_request_id = %id, reason, error = %e, "on_reverted dispatch failed");
        }
        self.notifier.notify_withdraw(id, "failed", Some(reason.to_string()));
    }

    async fn on_submission_exhausted(&self, tx: &PendingTransaction, reason: &str) {
        let Some(id) = Self::withdraw_id(tx) else { return };
        let result = match tx.task_data.kind {
            PendingTxKind::WithdrawExecute => self.orchestrator.execute_submit_failed(id, reason).await,
            PendingTxKind::Payout => self.orchestrator.payout_failed(id, tx.task_data.chain_id, 1, reason).await,
            PendingTxKind::Hook => self.orchestrator.hook_failed(id, reason).await,
            PendingTxKind::Fallback => {
                warn!(withdraw_request_id = %id, reason, "fallback transfer submission exhausted, no automatic retry");
                Ok(())
            }
            PendingTxKind::Commitment => return,
        };
        if let Err(e) = result {
            warn!(withdraw_request_id = %id, reason, error = %e, "on_submission_exhausted dispatch failed");
        }
        self.notifier.notify_withdraw(id, "failed", Some(reason.to_string()));
    }
}

/// Adapts the external prover's withdraw-proof response into the
/// orchestrator's `complete_proof`/`fail_proof` calls.
pub struct WithdrawProofTaskSink {
    orchestrator: Arc<WithdrawOrchestrator>,
    relayer_operator_address: String,
    protocol_contract_addresses: HashMap<u32, String>,
    proof_max_retries: u32,
    notifier: Arc<PushNotifier>,
}

impl WithdrawProofTaskSink {
    pub fn new(
        orchestrator: Arc<WithdrawOrchestrator>,
        relayer_operator_address: String,
        protocol_contract_addresses: HashMap<u32, String>,
        proof_max_retries: u32,
        notifier: Arc<PushNotifier>,
    ) -> Self {
        Self { orchestrator, relayer_operator_address, protocol_contract_addresses, proof_max_retries, notifier }
    }

    fn contract_for(&self, chain_id: u32) -> Result<String, DomainError> {
        self.protocol_contract_addresses
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| DomainError::Fatal(format!("no protocol contract address configured for chain {chain_id}")))
    }
}

#[async_trait::async_trait]
impl WithdrawProofSink for WithdrawProofTaskSink {
    async fn on_success(&self, withdraw_request_id: uuid::Uuid, response: WithdrawProofResponse) {
        let result = match parse_proof_result(&response) {
            Ok(r) => r,
            Err(e) => {
                warn!(withdraw_request_id = %withdraw_request_id, error = %e, "malformed withdraw proof response");
                let _ = self
                    .orchestrator
                    .fail_proof(withdraw_request_id, &e.to_string(), self.proof_max_retries)
                    .await;
                return;
            }
        };
        let to_address = match self.contract_for(response.recipient_chain_id) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(withdraw_request_id = %withdraw_request_id, error = %e, "no Execute-chain contract configured");
                let _ = self
                    .orchestrator
                    .fail_proof(withdraw_request_id, &e.to_string(), self.proof_max_retries)
                    .await;
                return;
            }
        };
        let execute = ExecuteParams {
            chain_id: response.recipient_chain_id,
            sender_address: self.relayer_operator_address.clone(),
            to_address,
            calldata: build_execute_calldata(&response.proof_data, &response.public_values),
        };
        if let Err(e) = self.orchestrator.complete_proof(withdraw_request_id, &result, execute).await {
            warn!(withdraw_request_id = %withdraw_request_id, error = %e, "complete_proof failed");
        }
    }

    async fn on_failure(&self, withdraw_request_id: uuid::Uuid, reason: &str, _exhausted: bool) {
        if let Err(e) = self.orchestrator.fail_proof(withdraw_request_id, reason, self.proof_max_retries).await {
            warn!(withdraw_request_id = %withdraw_request_id, error = %e, "fail_proof failed");
        }
        self.notifier.notify_withdraw(withdraw_request_id, "failed", Some(reason.to_string()));
    }
}

/// The Execute-chain contract call is opaque to the relayer: it forwards
/// the prover's proof and public values verbatim as calldata, in the
/// order the contract's ABI expects them concatenated.
fn build_execute_calldata(proof_data: &str, public_values: &str) -> String {
    let proof = proof_data.strip_prefix("0x").unwrap_or(proof_data);
    let public = public_values.strip_prefix("0x").unwrap_or(public_values);
    format!("0x{proof}{public}")
}

fn parse_proof_result(response: &WithdrawProofResponse) -> Result<WithdrawProofResult, DomainError> {
    let commitment_root = parse_hex32(&response.commitment_root)?;
    let nullifiers = response
        .nullifiers
        .iter()
        .map(|n| parse_hex32(n))
        .collect::<Result<Vec<_>, _>>()?;
    if nullifiers.is_empty() {
        return Err(DomainError::Invalid("withdraw proof response carries no nullifiers".into()));
    }
    Ok(WithdrawProofResult { nullifiers, commitment_root })
}

fn parse_hex32(s: &str) -> Result<[u8; 32], DomainError> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(stripped).map_err(|e| DomainError::Invalid(format!("invalid hex '{s}': {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| DomainError::Invalid(format!("expected 32 bytes, got {}", b.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_hex32_fields() {
        let resp = WithdrawProofResponse {
            success: true,
            proof_data: "0xaa".into(),
            public_values: "0xbb".into(),
            recipient_chain_id: 714,
            recipient_address: "0xrecipient".into(),
            amount: "1000".into(),
            token_key: "USDT".into(),
            commitment_root: format!("0x{}", "11".repeat(32)),
            nullifiers: vec![format!("0x{}", "22".repeat(32))],
            timestamp: 0,
            error_message: None,
        };
        let result = parse_proof_result(&resp).unwrap();
        assert_eq!(result.commitment_root, [0x11; 32]);
        assert_eq!(result.nullifiers, vec![[0x22; 32]]);
    }

    #[test]
    fn rejects_wrong_length_hex() {
        let resp = WithdrawProofResponse {
            success: true,
            proof_data: "0xaa".into(),
            public_values: "0xbb".into(),
            recipient_chain_id: 714,
            recipient_address: "0xrecipient".into(),
            amount: "1000".into(),
            token_key: "USDT".into(),
            commitment_root: "0xdead".into(),
            nullifiers: vec![],
            timestamp: 0,
            error_message: None,
        };
        assert!(parse_proof_result(&resp).is_err());
    }

    #[test]
    fn concatenates_proof_and_public_values_for_calldata() {
        assert_eq!(build_execute_calldata("0xaa", "0xbb"), "0xaabb");
    }
}
