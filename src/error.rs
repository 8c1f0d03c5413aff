use std::time::Duration;

/// Crate-wide error taxonomy (spec §7). Every module maps its local error
/// type into one of these kinds at the point it crosses a component
/// boundary, so callers can apply one propagation policy regardless of
/// which collaborator produced the error.
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Network/RPC failure, safe to retry with backoff.
    Transient(String),
    /// CAS lost, nonce already consumed, or duplicate idempotency key.
    /// Recovered locally; never bubbled up as a failure.
    Conflict(String),
    /// Bad input, signature verification failure, amount mismatch.
    /// Surfaced to the entity's sub-status; never retried automatically.
    Invalid(String),
    /// Retry cap reached.
    Exhausted(String),
    /// Proof rejected on-chain or a worker call reverted.
    OnChainReverted(String),
    /// Prover/KMS/scanner collaborator failure.
    External(String),
    /// DB unreachable or configuration missing. Aborts the worker.
    Fatal(String),
}

impl DomainError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DomainError::Transient(_) => "transient",
            DomainError::Conflict(_) => "conflict",
            DomainError::Invalid(_) => "invalid",
            DomainError::Exhausted(_) => "exhausted",
            DomainError::OnChainReverted(_) => "on_chain_reverted",
            DomainError::External(_) => "external",
            DomainError::Fatal(_) => "fatal",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainError::Transient(msg) => write!(f, "transient: {msg}"),
            DomainError::Conflict(msg) => write!(f, "conflict: {msg}"),
            DomainError::Invalid(msg) => write!(f, "invalid: {msg}"),
            DomainError::Exhausted(msg) => write!(f, "exhausted: {msg}"),
            DomainError::OnChainReverted(msg) => write!(f, "on-chain reverted: {msg}"),
            DomainError::External(msg) => write!(f, "external: {msg}"),
            DomainError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for DomainError {}

impl From<sqlx::Error> for DomainError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => DomainError::Transient(e.to_string()),
            sqlx::Error::RowNotFound => DomainError::Conflict("row not found".into()),
            _ => DomainError::Fatal(e.to_string()),
        }
    }
}

impl From<crate::ingestor::envelope::EnvelopeError> for DomainError {
    fn from(e: crate::ingestor::envelope::EnvelopeError) -> Self {
        DomainError::Invalid(e.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            DomainError::Transient(e.to_string())
        } else {
            DomainError::External(e.to_string())
        }
    }
}

/// Retry/backoff policy shared by the proof runner, tx queue, and polling
/// reconciler so "exponential backoff capped at 10 minutes" (spec §4.7,
/// §7) is implemented exactly once.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DomainError {
    fn is_retryable(&self) -> bool {
        matches!(self, DomainError::Transient(_) | DomainError::External(_))
    }
}

/// Default retry backoff base, matching spec's "exponential backoff capped
/// at 10 minutes" language used for proof tasks, tx resubmission, and
/// subgraph catch-up.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);
const BASE_BACKOFF_MS: u64 = 2_000;

/// Computes `base * 2^attempt`, capped at `MAX_BACKOFF`.
pub fn backoff_after(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(20); // avoid overflow before the cap kicks in
    let ms = BASE_BACKOFF_MS.saturating_mul(1u64 << capped_attempt);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}
