pub mod chain;
pub mod commitment;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod ingestor;
pub mod notifier;
pub mod polling;
pub mod prover;
pub mod telemetry;
pub mod txqueue;
pub mod withdraw;
