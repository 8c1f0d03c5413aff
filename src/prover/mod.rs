//! Proof Task Runner (spec §4.7): claims due proof tasks, calls the
//! external prover over HTTP, and reports outcomes back via sinks.

pub mod client;
pub mod runner;

pub use client::ProverClient;
pub use runner::{CommitmentProofSink, ProofTaskRunner, WithdrawProofSink};
