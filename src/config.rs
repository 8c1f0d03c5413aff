use std::collections::HashMap;
use std::env;

/// Process-wide configuration, read once at startup from the environment.
/// Mirrors the recognised options in spec §6.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    // Server
    pub host: String,
    pub port: u16,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // ZK prover
    pub zkvm_base_url: String,
    pub zkvm_timeout_secs: u64,

    // NATS
    pub nats_url: String,
    pub nats_timeout_secs: u64,

    // Scanner
    pub scanner_type: ScannerType,
    pub scanner_http_base_url: Option<String>,
    pub scanner_timeout_secs: u64,

    // Subgraph catch-up, per chain slip44 id
    pub subgraph_urls: HashMap<u32, String>,
    pub subgraph_api_keys: HashMap<u32, String>,
    pub subgraph_poll_interval_secs: u64,

    // KMS (treated purely as an external collaborator URL; signing itself
    // is out of scope per spec §1)
    pub kms_service_url: Option<String>,
    pub kms_auth_token: Option<String>,

    // Per-chain RPC endpoints, keyed by SLIP-44 id
    pub chain_rpc_endpoints: HashMap<u32, String>,

    // Per-chain deployed contract address the tx queue sends
    // commitment-submission / executeWithdraw / payout / hook calls to,
    // keyed by SLIP-44 id (spec §4.4/§4.5 refer to these only by role —
    // "the Checkbook contract", "the Treasury" — the address itself is
    // deployment-specific).
    pub protocol_contract_addresses: HashMap<u32, String>,

    // Address the tx queue submits withdraw/payout/hook calls from; KMS
    // holds the matching key (spec §1: signing itself is out of scope).
    pub relayer_operator_address: String,

    // Bounded concurrency
    pub ingestor_concurrency: usize,
    pub commitment_proof_concurrency: usize,
    pub withdraw_proof_concurrency: usize,
    pub tx_queue_concurrency: usize,
    pub polling_concurrency: usize,

    // Polling reconciler
    pub poll_interval_secs: u64,
    pub poll_max_retries: u32,

    // CORS for the operational HTTP surface (health/readiness only)
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerType {
    Nats,
    Http,
}

impl RelayerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require_env("DATABASE_URL")?;
        let zkvm_base_url = require_env("ZKVM_BASE_URL")?;
        validate_url(&zkvm_base_url, "ZKVM_BASE_URL")?;
        let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into());

        let scanner_type = match env::var("SCANNER_TYPE").unwrap_or_else(|_| "nats".into()).as_str() {
            "nats" => ScannerType::Nats,
            "http" => ScannerType::Http,
            other => {
                return Err(ConfigError::Invalid(
                    "SCANNER_TYPE".into(),
                    format!("must be 'nats' or 'http', got '{other}'"),
                ))
            }
        };
        let scanner_http_base_url = env::var("SCANNER_HTTP_BASE_URL").ok().filter(|s| !s.is_empty());
        if scanner_type == ScannerType::Http && scanner_http_base_url.is_none() {
            return Err(ConfigError::Missing(
                "SCANNER_HTTP_BASE_URL (required when SCANNER_TYPE=http)".into(),
            ));
        }

        let subgraph_urls = collect_chain_keyed_env("SUBGRAPH_URL_");
        let subgraph_api_keys = collect_chain_keyed_env("SUBGRAPH_API_KEY_");
        let chain_rpc_endpoints = collect_chain_keyed_env("CHAIN_RPC_");
        if chain_rpc_endpoints.is_empty() {
            return Err(ConfigError::Missing(
                "at least one CHAIN_RPC_<slip44> env var".into(),
            ));
        }
        let relayer_operator_address = require_env("RELAYER_OPERATOR_ADDRESS")?;
        let protocol_contract_addresses = collect_chain_keyed_env("PROTOCOL_CONTRACT_");

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_env_or("PORT", 8090u16)?,
            database_url,
            database_max_connections: parse_env_or("DATABASE_MAX_CONNECTIONS", 10u32)?,
            zkvm_base_url,
            zkvm_timeout_secs: parse_env_or("ZKVM_TIMEOUT_SECONDS", 600u64)?,
            nats_url,
            nats_timeout_secs: parse_env_or("NATS_TIMEOUT_SECONDS", 5u64)?,
            scanner_type,
            scanner_http_base_url,
            scanner_timeout_secs: parse_env_or("SCANNER_TIMEOUT_SECONDS", 15u64)?,
            subgraph_urls,
            subgraph_api_keys,
            subgraph_poll_interval_secs: parse_env_or("SUBGRAPH_POLL_INTERVAL_SECS", 30u64)?,
            kms_service_url: env::var("KMS_SERVICE_URL").ok().filter(|s| !s.is_empty()),
            kms_auth_token: env::var("KMS_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
            chain_rpc_endpoints,
            relayer_operator_address,
            protocol_contract_addresses,
            ingestor_concurrency: parse_env_or("INGESTOR_CONCURRENCY", 8usize)?,
            commitment_proof_concurrency: parse_env_or("COMMITMENT_PROOF_CONCURRENCY", 4usize)?,
            withdraw_proof_concurrency: parse_env_or("WITHDRAW_PROOF_CONCURRENCY", 4usize)?,
            tx_queue_concurrency: parse_env_or("TX_QUEUE_CONCURRENCY", 4usize)?,
            polling_concurrency: parse_env_or("POLLING_CONCURRENCY", 8usize)?,
            poll_interval_secs: parse_env_or("POLL_INTERVAL_SECS", 10u64)?,
            poll_max_retries: parse_env_or("POLL_MAX_RETRIES", 180u32)?,
            allowed_origins,
        })
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") || lower.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(name.into(), "must be an http(s) URL".into()))
    }
}

/// Collects `PREFIX<slip44>=value` env vars into a map keyed by the numeric
/// suffix, e.g. `CHAIN_RPC_714=https://...` -> `{714: "https://..."}`.
fn collect_chain_keyed_env(prefix: &str) -> HashMap<u32, String> {
    env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .and_then(|suffix| suffix.parse::<u32>().ok())
                .map(|chain_id| (chain_id, v))
        })
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => write!(f, "invalid env var {name}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
