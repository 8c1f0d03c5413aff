//! Push Notifier (spec §4.9 / component table row 9): fans state changes
//! out to whichever sessions are subscribed to an entity. The actual
//! WebSocket transport is external — this crate only owns the in-process
//! broadcast hub a transport layer would subscribe to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Checkbook,
    WithdrawRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChangeEvent {
    pub entity: EntityKind,
    pub entity_id: Uuid,
    pub status: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// One broadcast channel per subscribed entity. A slow or absent
/// subscriber never blocks a publisher — `broadcast::Sender::send` only
/// fails when there are zero receivers, which publishers treat as a no-op.
pub struct NotificationHub {
    channels: DashMap<Uuid, broadcast::Sender<StateChangeEvent>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    pub fn subscribe(&self, entity_id: Uuid) -> broadcast::Receiver<StateChangeEvent> {
        self.channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, event: StateChangeEvent) {
        if let Some(sender) = self.channels.get(&event.entity_id) {
            let _ = sender.send(event);
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin convenience wrapper so sinks don't have to build `StateChangeEvent`
/// by hand at every call site.
pub struct PushNotifier {
    hub: Arc<NotificationHub>,
}

impl PushNotifier {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }

    pub fn notify_checkbook(&self, checkbook_id: Uuid, status: &str, message: Option<String>) {
        self.hub.publish(StateChangeEvent {
            entity: EntityKind::Checkbook,
            entity_id: checkbook_id,
            status: status.to_string(),
            message,
            at: Utc::now(),
        });
    }

    pub fn notify_withdraw(&self, withdraw_request_id: Uuid, status: &str, message: Option<String>) {
        self.hub.publish(StateChangeEvent {
            entity: EntityKind::WithdrawRequest,
            entity_id: withdraw_request_id,
            status: status.to_string(),
            message,
            at: Utc::now(),
        });
    }
}
