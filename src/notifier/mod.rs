//! Push Notifier (spec component table row 9): fan-out of state changes to
//! subscribed sessions. The WebSocket transport itself is out of scope —
//! this module only owns the in-process hub a transport layer subscribes
//! to and the sinks publish into.

pub mod hub;

pub use hub::{EntityKind, NotificationHub, PushNotifier, StateChangeEvent};
