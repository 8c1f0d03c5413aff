//! Commitment Pipeline (spec §4.4): turns a recorded deposit into a
//! spendable `Checkbook` — allocation plan, ZK commitment proof, on-chain
//! submission, confirmation.

pub mod pipeline;
pub mod plan;
pub mod sinks;

pub use pipeline::{CommitParams, CommitmentPipeline, RecordDepositCommand, RequestAllocationPlanCommand};
pub use sinks::{CommitmentProofTaskSink, CommitmentTxSink};
