pub mod intent;
pub mod orchestrator;
pub mod rollup;
pub mod sinks;

pub use orchestrator::WithdrawOrchestrator;
pub use rollup::rollup_status;
pub use sinks::{WithdrawProofTaskSink, WithdrawTxSink};
