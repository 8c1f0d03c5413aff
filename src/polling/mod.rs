//! Polling Reconciler (spec §4.8): the fallback path that reconciles
//! database state with chain/scanner state whenever a push-driven event
//! (NATS) is lost.

pub mod reconciler;
pub mod scanner;
pub mod scheduler;

pub use reconciler::PollingReconciler;
pub use scanner::ScannerClient;
pub use scheduler::PollingScheduler;
