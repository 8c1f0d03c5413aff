//! `TransactionQueue` (spec §4.6): claims the next due pending_transaction
//! per sender/chain lane, assigns a nonce, submits via `ChainSender`, and
//! later confirms it. One in-flight transaction per lane at a time — the
//! next claim on that lane won't see a `pending` row to take until the
//! current one reaches `submitted`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::models::{PendingTransaction, PendingTxKind};
use crate::db::repository::RepositoryPort;
use crate::error::{backoff_after, DomainError, Retryable};

use super::sender::{ChainSender, TxConfirmation};

const PENDING_TRANSACTIONS_TABLE: &str = "pending_transactions";

/// Callbacks the queue fires as a lane's transaction moves through
/// submission and confirmation, so the withdraw orchestrator (or, for
/// `Commitment` rows, the commitment pipeline) can advance its own state
/// machine without the queue needing to know about either one.
#[async_trait::async_trait]
pub trait TxQueueSink: Send + Sync {
    async fn on_submitted(&self, tx: &PendingTransaction, tx_hash: &str);
    async fn on_confirmed(&self, tx: &PendingTransaction, tx_hash: &str);
    async fn on_reverted(&self, tx: &PendingTransaction, reason: &str);
    async fn on_submission_exhausted(&self, tx: &PendingTransaction, reason: &str);
}

pub struct TransactionQueue {
    repo: Arc<dyn RepositoryPort>,
    senders: HashMap<u32, Arc<dyn ChainSender>>,
    sink: Arc<dyn TxQueueSink>,
    max_retries: u32,
    poll_interval: Duration,
}

impl TransactionQueue {
    pub fn new(
        repo: Arc<dyn RepositoryPort>,
        senders: HashMap<u32, Arc<dyn ChainSender>>,
        sink: Arc<dyn TxQueueSink>,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self { repo, senders, sink, max_retries, poll_interval }
    }

    /// Resets rows a crashed worker left in `processing` back to `pending`
    /// (spec §4.6/§4.7 recovery rule). Must run once before any lane loop
    /// starts claiming.
    pub async fn recover_on_startup(&self) -> Result<u64, DomainError> {
        let n = self.repo.recover_stuck_processing_rows(PENDING_TRANSACTIONS_TABLE).await?;
        if n > 0 {
            warn!(count = n, "recovered pending_transactions stuck in processing");
        }
        Ok(n)
    }

    fn sender_for(&self, chain_id: u32) -> Result<Arc<dyn ChainSender>, DomainError> {
        self.senders
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| DomainError::Fatal(format!("no ChainSender configured for chain {chain_id}")))
    }

    /// Runs until `shutdown` fires, repeatedly claiming and submitting the
    /// next due transaction for one (sender, chain) lane.
    pub async fn run_lane(
        self: Arc<Self>,
        sender_address: String,
        chain_id: u32,
        shutdown: CancellationToken,
    ) {
        info!(sender = %sender_address, chain_id, "tx queue lane started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.repo.claim_one_pending_transaction(&sender_address, chain_id).await {
                Ok(Some(tx)) => {
                    if let Err(e) = self.process_claimed(tx).await {
                        error!(sender = %sender_address, chain_id, error = %e, "lane iteration failed");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(sender = %sender_address, chain_id, error = %e, "claim failed"),
            }
        }
        info!(sender = %sender_address, chain_id, "tx queue lane stopped");
    }

    async fn process_claimed(&self, tx: PendingTransaction) -> Result<(), DomainError> {
        let chain_id = tx.task_data.chain_id;
        let sender = self.sender_for(chain_id)?;

        let chain_nonce = sender.chain_nonce(chain_id, &tx.task_data.sender_address).await;
        let chain_nonce = match chain_nonce {
            Ok(n) => n,
            Err(e) => return self.defer_or_fail(&tx, e).await,
        };
        let highest_assigned = self
            .repo
            .highest_assigned_nonce(&tx.task_data.sender_address, chain_id)
            .await?;
        let nonce = super::nonce::next_nonce(chain_nonce, highest_assigned);

        match sender.submit(chain_id, &tx.task_data, nonce).await {
            Ok(tx_hash) => {
                self.repo.mark_transaction_submitted(tx.id, nonce, &tx_hash).await?;
                info!(id = %tx.id, chain_id, nonce, tx_hash = %tx_hash, "transaction submitted");
                self.sink.on_submitted(&tx, &tx_hash).await;
                Ok(())
            }
            Err(e) => self.defer_or_fail(&tx, e).await,
        }
    }

    async fn defer_or_fail(&self, tx: &PendingTransaction, error: DomainError) -> Result<(), DomainError> {
        if error.is_retryable() && tx.retry_count < self.max_retries {
            let next_retry_at = chrono::Utc::now() + chrono::Duration::from_std(backoff_after(tx.retry_count)).unwrap();
            self.repo
                .fail_task(PENDING_TRANSACTIONS_TABLE, tx.id, &error.to_string(), Some(next_retry_at))
                .await?;
            warn!(id = %tx.id, error = %error, "transaction submission deferred for retry");
        } else {
            self.repo
                .fail_task(PENDING_TRANSACTIONS_TABLE, tx.id, &error.to_string(), None)
                .await?;
            error!(id = %tx.id, error = %error, "transaction submission exhausted retries");
            self.sink.on_submission_exhausted(tx, &error.to_string()).await;
        }
        Ok(())
    }

    /// Runs until `shutdown` fires, polling every `submitted` row (across
    /// all lanes) for its receipt. Separate from `run_lane` because
    /// confirming needs no row lock (spec §4.6 step 4).
    pub async fn run_confirmation_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        info!("tx queue confirmation sweep started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.repo.list_submitted_transactions().await {
                Ok(rows) => {
                    for tx in rows {
                        if let Err(e) = self.confirm_one(&tx).await {
                            error!(id = %tx.id, error = %e, "confirmation check failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to list submitted transactions"),
            }
        }
        info!("tx queue confirmation sweep stopped");
    }

    async fn confirm_one(&self, tx: &PendingTransaction) -> Result<(), DomainError> {
        let tx_hash = tx
            .submission_context
            .as_ref()
            .and_then(|v| v.get("tx_hash"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomainError::Fatal(format!("submitted tx {} missing tx_hash", tx.id)))?;
        let sender = self.sender_for(tx.task_data.chain_id)?;
        match sender.confirm(tx.task_data.chain_id, tx_hash).await {
            Ok(TxConfirmation::Pending) => Ok(()),
            Ok(TxConfirmation::Success) => {
                self.repo.complete_task(PENDING_TRANSACTIONS_TABLE, tx.id).await?;
                info!(id = %tx.id, tx_hash, "transaction confirmed");
                self.sink.on_confirmed(tx, tx_hash).await;
                Ok(())
            }
            Ok(TxConfirmation::Reverted(reason)) => {
                self.repo.fail_task(PENDING_TRANSACTIONS_TABLE, tx.id, &reason, None).await?;
                warn!(id = %tx.id, tx_hash, reason = %reason, "transaction reverted");
                self.sink.on_reverted(tx, &reason).await;
                Ok(())
            }
            Err(e) => {
                warn!(id = %tx.id, tx_hash, error = %e, "confirmation check errored, will retry");
                Ok(())
            }
        }
    }
}

/// Dispatches each callback to whichever sink owns that row's kind —
/// `Commitment` rows to the commitment pipeline, everything else
/// (withdraw execute/payout/hook/fallback) to the withdraw orchestrator.
/// The same `pending_transactions` table carries both lifecycles (spec
/// §4.6), so one queue with one sink router serves both.
pub struct CompositeTxSink {
    pub commitment: Arc<dyn TxQueueSink>,
    pub withdraw: Arc<dyn TxQueueSink>,
}

impl CompositeTxSink {
    fn route(&self, tx: &PendingTransaction) -> &Arc<dyn TxQueueSink> {
        match tx.task_data.kind {
            PendingTxKind::Commitment => &self.commitment,
            _ => &self.withdraw,
        }
    }
}

#[async_trait::async_trait]
impl TxQueueSink for CompositeTxSink {
    async fn on_submitted(&self, tx: &PendingTransaction, tx_hash: &str) {
        self.route(tx).on_submitted(tx, tx_hash).await
    }
    async fn on_confirmed(&self, tx: &PendingTransaction, tx_hash: &str) {
        self.route(tx).on_confirmed(tx, tx_hash).await
    }
    async fn on_reverted(&self, tx: &PendingTransaction, reason: &str) {
        self.route(tx).on_reverted(tx, reason).await
    }
    async fn on_submission_exhausted(&self, tx: &PendingTransaction, reason: &str) {
        self.route(tx).on_submission_exhausted(tx, reason).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use uuid::Uuid;

    use crate::db::models::{PendingTransactionData, PendingTxKind, TaskRow, TaskStatus, Wei};
    use crate::db::test_support::InMemoryRepository;

    use super::*;

    struct StubSender {
        chain_nonce: u64,
        submit_result: StdMutex<Option<Result<String, DomainError>>>,
        confirm_result: StdMutex<Option<TxConfirmation>>,
    }

    #[async_trait::async_trait]
    impl ChainSender for StubSender {
        async fn chain_nonce(&self, _chain_id: u32, _sender_address: &str) -> Result<u64, DomainError> {
            Ok(self.chain_nonce)
        }
        async fn submit(
            &self,
            _chain_id: u32,
            _tx: &PendingTransactionData,
            _nonce: u64,
        ) -> Result<String, DomainError> {
            self.submit_result.lock().unwrap().take().unwrap_or(Ok("0xdead".into()))
        }
        async fn confirm(&self, _chain_id: u32, _tx_hash: &str) -> Result<TxConfirmation, DomainError> {
            Ok(self
                .confirm_result
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(TxConfirmation::Success))
        }
        async fn rebroadcast(
            &self,
            _chain_id: u32,
            _tx: &PendingTransactionData,
            _nonce: u64,
            _gas_bump_count: u32,
        ) -> Result<String, DomainError> {
            Ok("0xrebroadcast".into())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        submitted: StdMutex<Vec<String>>,
        confirmed: StdMutex<Vec<String>>,
        reverted: StdMutex<Vec<String>>,
        exhausted: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TxQueueSink for RecordingSink {
        async fn on_submitted(&self, _tx: &PendingTransaction, tx_hash: &str) {
            self.submitted.lock().unwrap().push(tx_hash.to_string());
        }
        async fn on_confirmed(&self, _tx: &PendingTransaction, tx_hash: &str) {
            self.confirmed.lock().unwrap().push(tx_hash.to_string());
        }
        async fn on_reverted(&self, _tx: &PendingTransaction, reason: &str) {
            self.reverted.lock().unwrap().push(reason.to_string());
        }
        async fn on_submission_exhausted(&self, _tx: &PendingTransaction, reason: &str) {
            self.exhausted.lock().unwrap().push(reason.to_string());
        }
    }

    fn sample_tx(chain_id: u32) -> PendingTransaction {
        TaskRow {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 5,
            next_retry_at: None,
            priority: PendingTxKind::WithdrawExecute.priority(),
            task_data: PendingTransactionData {
                kind: PendingTxKind::WithdrawExecute,
                sender_address: "0xsender".into(),
                chain_id,
                to_address: "0xto".into(),
                calldata: "0x".into(),
                value: Wei::from_str("0").unwrap(),
                withdraw_request_id: Some(Uuid::new_v4()),
                checkbook_id: None,
                assigned_nonce: None,
                gas_bump_count: 0,
            },
            submission_context: None,
            last_error: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn make_queue(
        sender: Arc<dyn ChainSender>,
        sink: Arc<RecordingSink>,
    ) -> (Arc<TransactionQueue>, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let mut senders: HashMap<u32, Arc<dyn ChainSender>> = HashMap::new();
        senders.insert(714, sender);
        let queue = Arc::new(TransactionQueue::new(
            repo.clone(),
            senders,
            sink,
            3,
            Duration::from_millis(10),
        ));
        (queue, repo)
    }

    #[tokio::test]
    async fn submits_claimed_transaction_and_notifies_sink() {
        let sender = Arc::new(StubSender {
            chain_nonce: 5,
            submit_result: StdMutex::new(Some(Ok("0xhash1".into()))),
            confirm_result: StdMutex::new(None),
        });
        let sink = Arc::new(RecordingSink::default());
        let (queue, repo) = make_queue(sender, sink.clone());

        let tx = sample_tx(714);
        repo.push_pending_transaction(tx.clone());

        let claimed = repo.claim_one_pending_transaction("0xsender", 714).await.unwrap().unwrap();
        queue.process_claimed(claimed).await.unwrap();

        assert_eq!(sink.submitted.lock().unwrap().as_slice(), ["0xhash1"]);
        let stored = repo.list_submitted_transactions().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].task_data.assigned_nonce, Some(5));
    }

    #[tokio::test]
    async fn confirmation_sweep_completes_and_notifies_sink() {
        let sender = Arc::new(StubSender {
            chain_nonce: 5,
            submit_result: StdMutex::new(Some(Ok("0xhash2".into()))),
            confirm_result: StdMutex::new(Some(TxConfirmation::Success)),
        });
        let sink = Arc::new(RecordingSink::default());
        let (queue, repo) = make_queue(sender, sink.clone());

        let tx = sample_tx(714);
        repo.push_pending_transaction(tx.clone());
        let claimed = repo.claim_one_pending_transaction("0xsender", 714).await.unwrap().unwrap();
        queue.process_claimed(claimed).await.unwrap();

        let submitted = repo.list_submitted_transactions().await.unwrap();
        queue.confirm_one(&submitted[0]).await.unwrap();

        assert_eq!(sink.confirmed.lock().unwrap().as_slice(), ["0xhash2"]);
        assert!(repo.list_submitted_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_submit_error_notifies_sink_as_exhausted() {
        let sender = Arc::new(StubSender {
            chain_nonce: 5,
            submit_result: StdMutex::new(Some(Err(DomainError::Invalid("bad calldata".into())))),
            confirm_result: StdMutex::new(None),
        });
        let sink = Arc::new(RecordingSink::default());
        let (queue, repo) = make_queue(sender, sink.clone());

        let tx = sample_tx(714);
        repo.push_pending_transaction(tx.clone());
        let claimed = repo.claim_one_pending_transaction("0xsender", 714).await.unwrap().unwrap();
        queue.process_claimed(claimed).await.unwrap();

        assert_eq!(sink.exhausted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_lane_claim_skips_the_nonce_a_crashed_submit_already_used() {
        // Chain hasn't confirmed the first submission yet (as if the relayer
        // crashed right after submitting), so `chain_nonce` still reports 5
        // for both claims. The second claim must still land on 6, not reuse 5.
        let sender = Arc::new(StubSender {
            chain_nonce: 5,
            submit_result: StdMutex::new(Some(Ok("0xhash1".into()))),
            confirm_result: StdMutex::new(None),
        });
        let sink = Arc::new(RecordingSink::default());
        let (queue, repo) = make_queue(sender, sink.clone());

        repo.push_pending_transaction(sample_tx(714));
        repo.push_pending_transaction(sample_tx(714));

        let first = repo.claim_one_pending_transaction("0xsender", 714).await.unwrap().unwrap();
        queue.process_claimed(first).await.unwrap();

        let second = repo.claim_one_pending_transaction("0xsender", 714).await.unwrap().unwrap();
        queue.process_claimed(second).await.unwrap();

        let stored = repo.list_submitted_transactions().await.unwrap();
        let mut nonces: Vec<_> = stored.iter().filter_map(|t| t.task_data.assigned_nonce).collect();
        nonces.sort();
        assert_eq!(nonces, vec![5, 6]);
    }
}
