//! NATS consumer (spec §4.3/§6): subscribes to the Treasury/ZKPayProxy/
//! IntentManager subjects for both the V1 and V2 contract names, normalizes
//! each message, upserts an idempotent event row, and dispatches to the
//! commitment pipeline or withdraw orchestrator.
//!
//! JetStream is attempted first (durable delivery across restarts); if
//! stream/consumer creation fails — no JetStream account, or the NATS
//! deployment runs core-only — this falls back to plain core-NATS
//! subscriptions. Durable consumers are not mandated; either mode
//! satisfies the crash-safety properties every other component relies on,
//! since `record_event_if_new`'s idempotency key is what actually
//! guarantees at-most-once handler execution, not the transport.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull};
use async_nats::Client;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::registry::ChainRegistry;
use crate::commitment::{CommitmentPipeline, RecordDepositCommand};
use crate::db::models::{EventLogRow, PollKind};
use crate::db::repository::RepositoryPort;
use crate::error::DomainError;
use crate::polling::PollingScheduler;
use crate::withdraw::orchestrator::{HookCallData, WithdrawOrchestrator};

use super::envelope::{normalize, NormalizedEvent};

const STREAM_NAME: &str = "ZKPAY_EVENTS";
const DURABLE_NAME: &str = "zkpay-relayer-ingestor";

/// (contract, event) pairs the ingestor subscribes to, covering both V1
/// (Treasury/ZKPayProxy) and V2 (EnclaveTreasury/EnclavePay/IntentManager)
/// contract names (spec §6). The subject's chain segment is always `*`.
const SUBJECTS: &[(&str, &str)] = &[
    ("Treasury", "DepositReceived"),
    ("EnclaveTreasury", "DepositReceived"),
    ("ZKPayProxy", "DepositRecorded"),
    ("EnclavePay", "DepositRecorded"),
    ("ZKPayProxy", "DepositUsed"),
    ("EnclavePay", "DepositUsed"),
    ("ZKPayProxy", "CommitmentRootUpdated"),
    ("EnclavePay", "CommitmentRootUpdated"),
    ("ZKPayProxy", "WithdrawRequested"),
    ("EnclavePay", "WithdrawRequested"),
    ("Treasury", "WithdrawExecuted"),
    ("EnclaveTreasury", "WithdrawExecuted"),
    ("IntentManager", "WithdrawExecuted"),
    ("Treasury", "PayoutExecuted"),
    ("EnclaveTreasury", "PayoutExecuted"),
    ("Treasury", "PayoutFailed"),
    ("EnclaveTreasury", "PayoutFailed"),
    ("Treasury", "PayoutRetryRecordCreated"),
    ("EnclaveTreasury", "PayoutRetryRecordCreated"),
    ("IntentManager", "HookExecuted"),
    ("IntentManager", "HookFailed"),
    ("IntentManager", "FallbackTransferred"),
    ("IntentManager", "FallbackFailed"),
    ("ZKPayProxy", "ManuallyResolved"),
    ("EnclavePay", "ManuallyResolved"),
];

fn subject_for(contract: &str, event: &str) -> String {
    format!("zkpay.*.{contract}.{event}")
}

/// The collaborators event handlers dispatch into. Bundled so `subgraph`'s
/// catch-up path can run the exact same handlers as the live NATS path.
pub struct IngestorDeps {
    pub repo: Arc<dyn RepositoryPort>,
    pub commitment: Arc<CommitmentPipeline>,
    pub withdraw: Arc<WithdrawOrchestrator>,
    pub registry: Arc<ChainRegistry>,
    pub polling: Arc<PollingScheduler>,
}

pub struct IngestorConsumer {
    client: Client,
    deps: IngestorDeps,
    concurrency: Arc<Semaphore>,
}

impl IngestorConsumer {
    pub fn new(client: Client, deps: IngestorDeps, concurrency: usize) -> Self {
        Self { client, deps, concurrency: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        match self.ensure_jetstream_consumer().await {
            Ok(consumer) => {
                info!("ingestor using JetStream pull consumer");
                self.run_jetstream_loop(consumer, shutdown).await;
            }
            Err(e) => {
                warn!(error = %e, "JetStream unavailable, falling back to core NATS subscriptions");
                self.run_core_nats_loop(shutdown).await;
            }
        }
    }

    async fn ensure_jetstream_consumer(&self) -> Result<pull::Stream, DomainError> {
        let js = jetstream::new(self.client.clone());
        let subjects: Vec<String> = SUBJECTS.iter().map(|(c, e)| subject_for(c, e)).collect();
        let stream = js
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| DomainError::Transient(format!("jetstream stream setup failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                DURABLE_NAME,
                pull::Config {
                    durable_name: Some(DURABLE_NAME.to_string()),
                    filter_subjects: subjects,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DomainError::Transient(format!("jetstream consumer setup failed: {e}")))?;

        consumer
            .messages()
            .await
            .map_err(|e| DomainError::Transient(format!("jetstream messages() failed: {e}")))
    }

    async fn run_jetstream_loop(&self, mut messages: pull::Stream, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = messages.next() => next,
            };
            let Some(msg) = next else { break };
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "jetstream message pull failed");
                    continue;
                }
            };
            let Ok(permit) = self.concurrency.clone().acquire_owned().await else { continue };
            let deps = self.deps.clone_handles();
            tokio::spawn(async move {
                let _permit = permit;
                let subject = msg.subject.to_string();
                let payload = msg.payload.clone();
                match process_message(&deps, &subject, &payload).await {
                    Ok(()) => {
                        if let Err(e) = msg.ack().await {
                            warn!(error = ?e, subject, "jetstream ack failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, subject, "event handling failed, nak-ing for redelivery");
                        let _ = msg.ack_with(jetstream::AckKind::Nak(None)).await;
                    }
                }
            });
        }
        info!("ingestor jetstream loop stopped");
    }

    async fn run_core_nats_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(SUBJECTS.len());
        for (contract, event) in SUBJECTS {
            let subject = subject_for(contract, event);
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { this.run_core_subject_loop(subject, shutdown).await }));
        }
        shutdown.cancelled().await;
        for h in handles {
            let _ = h.await;
        }
        info!("ingestor core-nats loop stopped");
    }

    async fn run_core_subject_loop(&self, subject: String, shutdown: CancellationToken) {
        let mut sub = match self.client.subscribe(subject.clone()).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, subject, "core-nats subscribe failed");
                return;
            }
        };
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = sub.next() => next,
            };
            let Some(msg) = next else { break };
            let Ok(permit) = self.concurrency.clone().acquire_owned().await else { continue };
            let deps = self.deps.clone_handles();
            let subject = msg.subject.to_string();
            let payload = msg.payload.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = process_message(&deps, &subject, &payload).await {
                    warn!(error = %e, subject, "event handling failed (core NATS delivers at most once, no redelivery)");
                }
            });
        }
    }
}

impl IngestorDeps {
    fn clone_handles(&self) -> IngestorDeps {
        IngestorDeps {
            repo: self.repo.clone(),
            commitment: self.commitment.clone(),
            withdraw: self.withdraw.clone(),
            registry: self.registry.clone(),
            polling: self.polling.clone(),
        }
    }
}

/// `zkpay.<chain>.<contract>.<event>` -> (chain_segment, contract, event).
fn parse_subject(subject: &str) -> Option<(&str, &str, &str)> {
    let mut parts = subject.splitn(4, '.');
    let _zkpay = parts.next()?;
    let chain = parts.next()?;
    let contract = parts.next()?;
    let event = parts.next()?;
    Some((chain, contract, event))
}

async fn process_message(deps: &IngestorDeps, subject: &str, payload: &[u8]) -> Result<(), DomainError> {
    let (chain_segment, contract, event_name) =
        parse_subject(subject).ok_or_else(|| DomainError::Invalid(format!("malformed subject {subject}")))?;
    let normalized = normalize(&deps.registry, payload, contract, event_name, chain_segment)?;
    ingest_event(deps, normalized).await
}

/// Shared entrypoint for both the live NATS path and the subgraph catch-up
/// path: upsert the idempotent event row, then dispatch exactly once.
pub async fn ingest_event(deps: &IngestorDeps, event: NormalizedEvent) -> Result<(), DomainError> {
    let row = EventLogRow {
        id: Uuid::new_v4(),
        chain_id: event.chain_id,
        transaction_hash: event.tx_hash.clone(),
        log_index: event.log_index,
        event_name: format!("{}.{}", event.contract, event.event_name),
        block_number: event.block_number,
        payload: event.data.clone(),
        received_at: chrono::Utc::now(),
    };
    let is_new = deps.repo.record_event_if_new(&row).await?;
    if !is_new {
        return Ok(());
    }
    dispatch(deps, &event).await
}

async fn dispatch(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    match (event.contract.as_str(), event.event_name.as_str()) {
        ("Treasury", "DepositReceived") | ("EnclaveTreasury", "DepositReceived") => {
            handle_deposit_received(deps, event).await
        }
        ("ZKPayProxy", "DepositRecorded") | ("EnclavePay", "DepositRecorded") => {
            handle_deposit_recorded(deps, event).await
        }
        ("ZKPayProxy", "DepositUsed") | ("EnclavePay", "DepositUsed") => Ok(()),
        ("ZKPayProxy", "CommitmentRootUpdated") | ("EnclavePay", "CommitmentRootUpdated") => {
            handle_commitment_root_updated(deps, event).await
        }
        ("ZKPayProxy", "WithdrawRequested") | ("EnclavePay", "WithdrawRequested") => {
            handle_withdraw_requested(deps, event).await
        }
        ("Treasury", "WithdrawExecuted") | ("EnclaveTreasury", "WithdrawExecuted") | ("IntentManager", "WithdrawExecuted") => {
            handle_withdraw_executed(deps, event).await
        }
        ("Treasury", "PayoutExecuted") | ("EnclaveTreasury", "PayoutExecuted") => handle_payout_executed(deps, event).await,
        ("Treasury", "PayoutFailed") | ("EnclaveTreasury", "PayoutFailed") => handle_payout_failed(deps, event).await,
        ("Treasury", "PayoutRetryRecordCreated") | ("EnclaveTreasury", "PayoutRetryRecordCreated") => Ok(()),
        ("IntentManager", "HookExecuted") => handle_hook_executed(deps, event).await,
        ("IntentManager", "HookFailed") => handle_hook_failed(deps, event).await,
        ("IntentManager", "FallbackTransferred") => handle_fallback_transferred(deps, event).await,
        ("IntentManager", "FallbackFailed") => handle_fallback_failed(deps, event).await,
        ("ZKPayProxy", "ManuallyResolved") | ("EnclavePay", "ManuallyResolved") => Ok(()),
        (contract, name) => {
            warn!(contract, name, "no handler registered for this event, recorded only");
            Ok(())
        }
    }
}

/// Duplicate V1/V2 emission for the same logical event, or simple
/// redelivery, lands on a CAS that's already past `expected` — that's a
/// harmless race, not a failure (spec §9).
fn ignore_conflict(result: Result<(), DomainError>) -> Result<(), DomainError> {
    match result {
        Err(DomainError::Conflict(_)) => Ok(()),
        other => other,
    }
}

async fn handle_deposit_received(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let data = &event.data;
    let local_deposit_id = field_str(data, "depositId")?.to_string();
    let owner = field_address(data, "owner", event.chain_id, deps.registry.is_evm(event.chain_id))?;
    let token_key = field_str(data, "tokenKey")?.to_string();
    let gross_amount = field_wei(data, "grossAmount")?;
    let allocatable_amount = field_wei(data, "allocatableAmount")?;
    let fee_total_locked = field_wei(data, "feeTotalLocked")?;

    let checkbook = deps
        .commitment
        .record_deposit(RecordDepositCommand {
            slip44_chain_id: event.chain_id,
            local_deposit_id,
            owner,
            token_key,
            gross_amount,
            allocatable_amount,
            fee_total_locked,
        })
        .await?;
    ignore_conflict(deps.commitment.mark_deposit_received(checkbook.id).await)?;
    if let Err(e) = deps.polling.schedule(PollKind::DepositRecorded, checkbook.id, event.chain_id, Value::Null).await {
        warn!(checkbook_id = %checkbook.id, error = %e, "failed to schedule DepositRecorded poll");
    }
    Ok(())
}

async fn handle_deposit_recorded(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let local_deposit_id = field_str(&event.data, "depositId")?;
    let checkbook = deps
        .repo
        .find_checkbook_by_deposit(event.chain_id, local_deposit_id)
        .await?
        .ok_or_else(|| DomainError::Conflict(format!("no checkbook for deposit {local_deposit_id}")))?;
    ignore_conflict(deps.commitment.mark_deposit_recorded(checkbook.id).await)
}

async fn handle_commitment_root_updated(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let commitment = field_hex32(&event.data, "commitment")?;
    let checkbook = deps
        .repo
        .find_checkbook_by_commitment(event.chain_id, commitment)
        .await?
        .ok_or_else(|| DomainError::Conflict("no checkbook for commitment".into()))?;
    ignore_conflict(deps.commitment.record_commitment_root_updated(checkbook.id).await)
}

async fn handle_withdraw_requested(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let data = &event.data;
    let nullifier = field_hex32(data, "nullifier").or_else(|_| field_hex32(data, "requestId"))?;
    let withdraw = find_withdraw(deps, nullifier).await?;
    let hook = hook_call_data_from(data)?;
    deps.withdraw.record_withdraw_requested(withdraw.id, hook).await
}

async fn handle_withdraw_executed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let nullifiers = field_hex32_array(&event.data, "nullifiers")?;
    let first = *nullifiers
        .first()
        .ok_or_else(|| DomainError::Invalid("WithdrawExecuted carried no nullifiers".into()))?;
    let withdraw = find_withdraw(deps, first).await?;
    deps.withdraw.record_withdraw_executed(withdraw.id, &nullifiers).await
}

async fn handle_payout_executed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let tx_hash = tx_hash_field(&event.data)?;
    ignore_conflict(deps.withdraw.payout_completed(withdraw.id, tx_hash).await)
}

async fn handle_payout_failed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let attempt = field_u32(&event.data, "attempt").unwrap_or(1);
    let reason = field_str(&event.data, "reason").unwrap_or("payout failed");
    ignore_conflict(deps.withdraw.payout_failed(withdraw.id, event.chain_id, attempt, reason).await)
}

async fn handle_hook_executed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let tx_hash = tx_hash_field(&event.data)?;
    ignore_conflict(deps.withdraw.hook_completed(withdraw.id, tx_hash).await)
}

async fn handle_hook_failed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let reason = field_str(&event.data, "reason").unwrap_or("hook failed");
    ignore_conflict(deps.withdraw.hook_failed(withdraw.id, reason).await)
}

async fn handle_fallback_transferred(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let attempt = field_u32(&event.data, "attempt").unwrap_or(1);
    let reason = field_str(&event.data, "reason").unwrap_or("fallback transferred");
    deps.withdraw.fallback_transferred(withdraw.id, event.chain_id, attempt, reason).await
}

async fn handle_fallback_failed(deps: &IngestorDeps, event: &NormalizedEvent) -> Result<(), DomainError> {
    let withdraw = resolve_withdraw_by_request_id(deps, &event.data).await?;
    let attempt = field_u32(&event.data, "attempt").unwrap_or(1);
    let reason = field_str(&event.data, "reason").unwrap_or("fallback failed");
    deps.withdraw.fallback_failed(withdraw.id, event.chain_id, attempt, reason).await
}

async fn find_withdraw(
    deps: &IngestorDeps,
    nullifier: [u8; 32],
) -> Result<crate::db::models::WithdrawRequest, DomainError> {
    deps.repo
        .find_withdraw_request_by_nullifier(nullifier)
        .await?
        .ok_or_else(|| DomainError::Conflict("no withdraw request for nullifier".into()))
}

async fn resolve_withdraw_by_request_id(
    deps: &IngestorDeps,
    data: &Value,
) -> Result<crate::db::models::WithdrawRequest, DomainError> {
    let nullifier = field_hex32(data, "requestId").or_else(|_| field_hex32(data, "nullifier"))?;
    find_withdraw(deps, nullifier).await
}

fn hook_call_data_from(data: &Value) -> Result<Option<HookCallData>, DomainError> {
    let intent_type = data.get("hookIntentType").and_then(Value::as_str).unwrap_or("");
    if intent_type.is_empty() {
        return Ok(None);
    }
    Ok(Some(HookCallData {
        hook_intent_type: intent_type.to_string(),
        hook_chain_id: field_u32(data, "hookChainId")?,
        hook_token_id: field_str(data, "hookTokenId")?.to_string(),
        hook_worker_id: field_str(data, "hookWorkerId")?.to_string(),
        hook_min_output_amount: field_wei_opt(data, "hookMinOutputAmount"),
    }))
}

fn tx_hash_field(data: &Value) -> Result<String, DomainError> {
    field_str(data, "txHash")
        .or_else(|_| field_str(data, "transactionHash"))
        .map(str::to_string)
}

fn field_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, DomainError> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::Invalid(format!("missing or non-string field '{key}'")))
}

fn field_u32(data: &Value, key: &str) -> Result<u32, DomainError> {
    let v = data.get(key).ok_or_else(|| DomainError::Invalid(format!("missing field '{key}'")))?;
    let parsed = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .map(|n| n as u32)
        .ok_or_else(|| DomainError::Invalid(format!("field '{key}' is not a number")))
}

fn field_wei(data: &Value, key: &str) -> Result<crate::db::models::Wei, DomainError> {
    field_wei_opt(data, key).ok_or_else(|| DomainError::Invalid(format!("missing or invalid amount field '{key}'")))
}

fn field_wei_opt(data: &Value, key: &str) -> Option<crate::db::models::Wei> {
    let v = data.get(key)?;
    let s = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    crate::db::models::Wei::from_str(&s).ok()
}

fn field_hex32(data: &Value, key: &str) -> Result<[u8; 32], DomainError> {
    let s = field_str(data, key)?;
    hex32_from_str(s).ok_or_else(|| DomainError::Invalid(format!("field '{key}' is not 32 bytes of hex")))
}

fn field_hex32_array(data: &Value, key: &str) -> Result<Vec<[u8; 32]>, DomainError> {
    let arr = data
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| DomainError::Invalid(format!("missing or non-array field '{key}'")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .and_then(hex32_from_str)
                .ok_or_else(|| DomainError::Invalid(format!("entry in '{key}' is not 32 bytes of hex")))
        })
        .collect()
}

fn hex32_from_str(s: &str) -> Option<[u8; 32]> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(body).ok()?;
    bytes.try_into().ok()
}

fn field_address(
    data: &Value,
    key: &str,
    chain_id: u32,
    is_evm: bool,
) -> Result<crate::chain::address::UniversalAddress, DomainError> {
    let raw = field_str(data, key)?;
    crate::chain::address::normalize_address_for_chain(raw, chain_id, is_evm)
        .map_err(|e| DomainError::Invalid(format!("invalid address in '{key}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_part_subject() {
        let (chain, contract, event) = parse_subject("zkpay.bsc.Treasury.DepositReceived").unwrap();
        assert_eq!(chain, "bsc");
        assert_eq!(contract, "Treasury");
        assert_eq!(event, "DepositReceived");
    }

    #[test]
    fn rejects_malformed_subject() {
        assert!(parse_subject("zkpay.bsc.Treasury").is_none());
    }

    #[test]
    fn hex32_from_str_accepts_0x_prefix_and_rejects_bad_length() {
        let s = format!("0x{}", "11".repeat(32));
        assert!(hex32_from_str(&s).is_some());
        assert!(hex32_from_str("0x1234").is_none());
    }

    #[test]
    fn ignore_conflict_swallows_conflict_only() {
        assert!(ignore_conflict(Err(DomainError::Conflict("x".into()))).is_ok());
        assert!(ignore_conflict(Err(DomainError::Invalid("x".into()))).is_err());
        assert!(ignore_conflict(Ok(())).is_ok());
    }

    #[test]
    fn covers_every_literal_subject() {
        assert_eq!(SUBJECTS.len(), 25);
        assert_eq!(subject_for("Treasury", "DepositReceived"), "zkpay.*.Treasury.DepositReceived");
    }
}
