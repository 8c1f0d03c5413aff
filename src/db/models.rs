//! Entity types for spec §3. These are plain Rust structs over the
//! relational schema; `db::repository`'s `*_from_row` helpers map a
//! `sqlx::postgres::PgRow`'s columns into them by hand (column types like
//! the tagged `Intent` enum and JSON task payloads don't fit a derived
//! `FromRow`), and `serde` lets the push notifier and prover client
//! serialize them without a second set of DTOs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::address::UniversalAddress;

/// Wei-accurate monetary amount. Wraps `rust_decimal::Decimal` so allocation
/// sum invariants (spec §8) are BigInt-exact, never float comparisons.
/// Stored as a decimal string at the wire/API boundary and as `NUMERIC` in
/// Postgres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wei(pub Decimal);

impl Wei {
    pub const ZERO: Wei = Wei(Decimal::ZERO);

    pub fn from_str(s: &str) -> Result<Self, rust_decimal::Error> {
        s.parse().map(Wei)
    }
}

impl std::ops::Add for Wei {
    type Output = Wei;
    fn add(self, rhs: Wei) -> Wei {
        Wei(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Wei {
    fn sum<I: Iterator<Item = Wei>>(iter: I) -> Self {
        iter.fold(Wei::ZERO, |acc, x| acc + x)
    }
}

impl std::fmt::Display for Wei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------
// Checkbook
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckbookStatus {
    Pending,
    Unsigned,
    ReadyForCommitment,
    GeneratingProof,
    SubmittingCommitment,
    CommitmentPending,
    WithCheckbook,
    ProofFailed,
    SubmissionFailed,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkbook {
    pub id: Uuid,
    pub slip44_chain_id: u32,
    pub local_deposit_id: String,
    pub owner: UniversalAddress,
    pub token_key: String,
    pub gross_amount: Wei,
    pub allocatable_amount: Wei,
    pub fee_total_locked: Wei,
    pub commitment: Option<[u8; 32]>,
    pub status: CheckbookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Allocation ("Check")
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Idle,
    Pending,
    Used,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub checkbook_id: Uuid,
    pub seq: u8,
    pub amount: Wei,
    pub status: AllocationStatus,
    pub nullifier: Option<[u8; 32]>,
    pub withdraw_request_id: Option<Uuid>,
}

// ---------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    RawToken {
        beneficiary: UniversalAddress,
        token_symbol: String,
    },
    AssetToken {
        asset_id: [u8; 32],
        beneficiary: UniversalAddress,
        asset_token_symbol: String,
    },
}

// ---------------------------------------------------------------------
// WithdrawRequest
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Pending,
    Submitted,
    Success,
    SubmitFailed,
    VerifyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    NotRequired,
    Pending,
    Processing,
    Completed,
    Failed,
    Abandoned,
}

/// Public roll-up status (spec §4.5). Derived, never stored independently
/// of the four sub-statuses — see `withdraw::rollup::rollup_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStatus {
    Cancelled,
    Created,
    Proving,
    ProofFailed,
    ProofGenerated,
    FailedPermanent,
    SubmitFailed,
    Submitting,
    WaitingForPayout,
    PayoutProcessing,
    Completed,
    HookProcessing,
    CompletedWithHookFailed,
}

/// Worker type for the payout transaction (spec §4.5 Stage 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayoutWorkerType {
    DirectTransfer = 0,
    UniswapSwap = 1,
    DeBridgeCrossChain = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: Uuid,
    pub withdraw_nullifier: Option<[u8; 32]>,
    pub queue_root: Option<[u8; 32]>,
    pub owner: UniversalAddress,
    pub intent: Intent,
    pub amount: Wei,
    pub allocation_ids: Vec<Uuid>,
    pub max_slippage_bps: Option<u32>,
    pub min_output_amount: Option<Wei>,
    pub payout_deadline: Option<DateTime<Utc>>,

    pub proof_status: ProofStatus,
    pub execute_status: ExecuteStatus,
    pub payout_status: PayoutStatus,
    pub hook_status: HookStatus,

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

    pub proof_retry_count: u32,
    pub execute_retry_count: u32,

    pub fallback_transferred: bool,
    pub user_cancelled: bool,

    pub proof_error: Option<String>,
    pub execute_error: Option<String>,
    pub payout_error: Option<String>,
    pub hook_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawRequest {
    /// Cancellable iff execute_status is neither submitted nor success
    /// (spec §4.5 cancellation contract). Mandatory, not merely allowed,
    /// when execute_status is verify_failed -- callers drive that via
    /// `WithdrawOrchestrator::cancel`, this predicate only answers
    /// "may I".
    pub fn can_cancel(&self) -> bool {
        !matches!(self.execute_status, ExecuteStatus::Submitted | ExecuteStatus::Success)
    }

    /// True when on-chain state means the allocations can never be spent
    /// and cancellation is mandatory to release them.
    pub fn must_cancel(&self) -> bool {
        matches!(self.execute_status, ExecuteStatus::VerifyFailed)
    }

    pub fn can_retry_execute(&self) -> bool {
        matches!(self.execute_status, ExecuteStatus::SubmitFailed)
    }
}

// ---------------------------------------------------------------------
// QueueRoot
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRoot {
    pub root: [u8; 32],
    pub previous_root: Option<[u8; 32]>,
    pub created_by_commitment: Option<[u8; 32]>,
    pub chain_id: u32,
    pub block_number: u64,
    pub is_recent_root: bool,
}

// ---------------------------------------------------------------------
// Task rows
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    /// `Submitted` applies only to `PendingTransaction`; proof tasks use
    /// `Completed` instead. Both share this enum since their claim/retry
    /// semantics (spec §3) are otherwise identical.
    Submitted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow<T> {
    pub id: Uuid,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub task_data: T,
    pub submission_context: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentGroup {
    pub checkbook_id: Uuid,
    pub allocations: Vec<(u8, Wei)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofGenerationTaskData {
    pub checkbook_id: Uuid,
    pub allocations: Vec<(u8, Wei)>,
    pub deposit_id: String,
    pub owner: UniversalAddress,
    pub token_key: String,
    pub language: String,
    pub signature: String,
}

pub type ProofGenerationTask = TaskRow<ProofGenerationTaskData>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawProofGenerationTaskData {
    pub withdraw_request_id: Uuid,
    pub commitment_groups: Vec<CommitmentGroup>,
    pub owner: UniversalAddress,
    pub intent: Intent,
    pub source_chain_name: Option<String>,
    pub target_chain_name: Option<String>,
    pub source_token_symbol: String,
    pub min_output: Option<Wei>,
    pub signature: String,
}

pub type WithdrawProofGenerationTask = TaskRow<WithdrawProofGenerationTaskData>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingTxKind {
    Commitment,
    WithdrawExecute,
    Payout,
    Hook,
    Fallback,
}

impl PendingTxKind {
    /// Priority ranking, lower = sooner (spec §4.6).
    pub fn priority(self) -> i32 {
        match self {
            PendingTxKind::Commitment => 10,
            PendingTxKind::WithdrawExecute => 20,
            PendingTxKind::Payout => 30,
            PendingTxKind::Hook => 40,
            PendingTxKind::Fallback => 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransactionData {
    pub kind: PendingTxKind,
    pub sender_address: String,
    pub chain_id: u32,
    pub to_address: String,
    pub calldata: String,
    pub value: Wei,
    /// Links this tx back to the entity driving it, so the tx queue can
    /// hand outcomes to the right state machine (spec §4.6).
    pub withdraw_request_id: Option<Uuid>,
    pub checkbook_id: Option<Uuid>,
    pub assigned_nonce: Option<u64>,
    pub gas_bump_count: u32,
}

pub type PendingTransaction = TaskRow<PendingTransactionData>;

// ---------------------------------------------------------------------
// Polling tasks
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    DepositRecorded,
    CommitmentRootUpdated,
    TxReceipt,
    NullifierUsed,
    WithdrawRequestedEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTaskData {
    pub poll_kind: PollKind,
    pub entity_id: Uuid,
    pub chain_id: u32,
    pub expected_fact: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTask {
    pub id: Uuid,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_poll_at: DateTime<Utc>,
    pub poll_interval_secs: u64,
    pub data: PollingTaskData,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------
// Retry records (write-only mirrors of on-chain retry state, spec §3/§9)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRetryRecord {
    pub id: Uuid,
    pub withdraw_request_id: Uuid,
    pub chain_id: u32,
    pub attempt: u32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRetryRecord {
    pub id: Uuid,
    pub withdraw_request_id: Uuid,
    pub chain_id: u32,
    pub attempt: u32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// EventLog rows
// ---------------------------------------------------------------------

/// Idempotency key for ingested events: `(chain_id, transaction_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventIdempotencyKey {
    pub chain_id: u32,
    pub transaction_hash: String,
    pub log_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRow {
    pub id: Uuid,
    pub chain_id: u32,
    pub transaction_hash: String,
    pub log_index: u64,
    pub event_name: String,
    pub block_number: u64,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Per-(chain, subgraph_url) catch-up cursor (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphCursor {
    pub chain_id: u32,
    pub subgraph_url: String,
    pub last_synced_block: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wei_sum_is_bigint_exact() {
        let amounts = vec![
            Wei::from_str("1000000000000000000").unwrap(),
            Wei::from_str("2000000000000000000").unwrap(),
            Wei::from_str("3000000000000000000").unwrap(),
        ];
        let total: Wei = amounts.into_iter().sum();
        assert_eq!(total, Wei::from_str("6000000000000000000").unwrap());
    }

    #[test]
    fn can_cancel_false_once_submitted_or_success() {
        let mut w = sample_withdraw_request();
        w.execute_status = ExecuteStatus::Pending;
        assert!(w.can_cancel());
        w.execute_status = ExecuteStatus::Submitted;
        assert!(!w.can_cancel());
        w.execute_status = ExecuteStatus::Success;
        assert!(!w.can_cancel());
    }

    #[test]
    fn must_cancel_only_on_verify_failed() {
        let mut w = sample_withdraw_request();
        w.execute_status = ExecuteStatus::VerifyFailed;
        assert!(w.must_cancel());
        assert!(w.can_cancel());
        w.execute_status = ExecuteStatus::SubmitFailed;
        assert!(!w.must_cancel());
    }

    fn sample_withdraw_request() -> WithdrawRequest {
        WithdrawRequest {
            id: Uuid::nil(),
            withdraw_nullifier: None,
            queue_root: None,
            owner: UniversalAddress::new(714, [0; 32]),
            intent: Intent::RawToken {
                beneficiary: UniversalAddress::new(714, [0; 32]),
                token_symbol: "USDT".into(),
            },
            amount: Wei::ZERO,
            allocation_ids: vec![],
            max_slippage_bps: None,
            min_output_amount: None,
            payout_deadline: None,
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
        }
    }
}
