//! Schedules the polling-task safety net alongside every action that
//! expects a follow-up push event (spec §4.8: "poll types mirror every
//! push-driven transition so that a dropped NATS message cannot strand an
//! entity"). Called from the sink adapters at the same point they'd
//! otherwise just log "awaiting X".

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::models::{PollKind, PollingTask, PollingTaskData, TaskStatus};
use crate::db::repository::RepositoryPort;
use crate::error::DomainError;

pub struct PollingScheduler {
    repo: Arc<dyn RepositoryPort>,
    poll_interval_secs: u64,
    max_retries: u32,
}

impl PollingScheduler {
    pub fn new(repo: Arc<dyn RepositoryPort>, poll_interval_secs: u64, max_retries: u32) -> Self {
        Self { repo, poll_interval_secs, max_retries }
    }

    pub async fn schedule(
        &self,
        poll_kind: PollKind,
        entity_id: Uuid,
        chain_id: u32,
        expected_fact: serde_json::Value,
    ) -> Result<(), DomainError> {
        let task = PollingTask {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            next_poll_at: Utc::now() + chrono::Duration::seconds(self.poll_interval_secs as i64),
            poll_interval_secs: self.poll_interval_secs,
            data: PollingTaskData { poll_kind, entity_id, chain_id, expected_fact },
            last_error: None,
        };
        self.repo.insert_polling_task(&task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::InMemoryRepository;

    #[tokio::test]
    async fn schedule_inserts_a_pending_task() {
        let repo: Arc<dyn RepositoryPort> = Arc::new(InMemoryRepository::new());
        let scheduler = PollingScheduler::new(repo.clone(), 10, 180);
        scheduler
            .schedule(PollKind::DepositRecorded, Uuid::new_v4(), 714, serde_json::json!({}))
            .await
            .unwrap();
        let claimed = repo.claim_one_due_polling_task().await.unwrap();
        assert!(claimed.is_none(), "task isn't due yet");
    }
}
