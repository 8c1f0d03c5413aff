//! Transaction Queue (spec §4.6): per-(sender, chain) nonce assignment and
//! submission for every on-chain call the relayer makes on its own behalf
//! (commitment submission, withdraw execute, payout, hook, fallback).

pub mod nonce;
pub mod queue;
pub mod sender;

pub use queue::{CompositeTxSink, TransactionQueue, TxQueueSink};
pub use sender::{ChainSender, TxConfirmation};
