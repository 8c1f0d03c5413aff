//! `ChainSender` (spec §4.6 step 3, §1 Non-goals): signing is a KMS
//! collaborator reached over HTTP, never a local key. This module only
//! builds the unsigned call, asks the KMS client for a signature, and
//! relays the result to the chain's own RPC.

use serde_json::{json, Value};

use crate::chain::registry::ChainRegistry;
use crate::db::models::PendingTransactionData;
use crate::error::DomainError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxConfirmation {
    Pending,
    Success,
    Reverted(String),
}

#[async_trait::async_trait]
pub trait ChainSender: Send + Sync {
    async fn chain_nonce(&self, chain_id: u32, sender_address: &str) -> Result<u64, DomainError>;
    async fn submit(
        &self,
        chain_id: u32,
        tx: &PendingTransactionData,
        nonce: u64,
    ) -> Result<String, DomainError>;
    async fn confirm(&self, chain_id: u32, tx_hash: &str) -> Result<TxConfirmation, DomainError>;
    async fn rebroadcast(
        &self,
        chain_id: u32,
        tx: &PendingTransactionData,
        nonce: u64,
        gas_bump_count: u32,
    ) -> Result<String, DomainError>;
}

/// Stateless HTTP client for the external KMS signer (spec §1: "KMS
/// dual-layer signing" is explicitly out of scope; this only relays a
/// signing request and returns the raw signed payload it hands back).
pub struct KmsClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl KmsClient {
    pub fn new(http: reqwest::Client, base_url: String, auth_token: Option<String>) -> Self {
        Self { http, base_url, auth_token }
    }

    async fn sign(&self, path: &str, body: Value) -> Result<String, DomainError> {
        let mut req = self.http.post(format!("{}{}", self.base_url, path)).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DomainError::External(format!("kms sign failed ({status}): {body}")));
        }
        let parsed: Value = resp.json().await?;
        parsed
            .get("signed_raw_tx")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DomainError::External("kms response missing signed_raw_tx".into()))
    }
}

/// EVM chains via plain JSON-RPC over HTTP: `eth_getTransactionCount`,
/// `eth_sendRawTransaction`, `eth_getTransactionReceipt`. Gas pricing for a
/// rebroadcast is left to the KMS signer, which is told the bump count.
pub struct EvmSender {
    http: reqwest::Client,
    registry: std::sync::Arc<ChainRegistry>,
    kms: KmsClient,
}

impl EvmSender {
    pub fn new(http: reqwest::Client, registry: std::sync::Arc<ChainRegistry>, kms: KmsClient) -> Self {
        Self { http, registry, kms }
    }

    fn rpc_url(&self, chain_id: u32) -> Result<&str, DomainError> {
        self.registry
            .rpc_endpoint(chain_id)
            .ok_or_else(|| DomainError::Fatal(format!("no RPC endpoint configured for chain {chain_id}")))
    }

    async fn rpc_call(&self, chain_id: u32, method: &str, params: Value) -> Result<Value, DomainError> {
        let url = self.rpc_url(chain_id)?;
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let resp: Value = self.http.post(url).json(&body).send().await?.json().await?;
        if let Some(err) = resp.get("error") {
            return Err(DomainError::Transient(format!("rpc error calling {method}: {err}")));
        }
        resp.get("result")
            .cloned()
            .ok_or_else(|| DomainError::Transient(format!("rpc {method} returned no result")))
    }

    async fn submit_signed(&self, chain_id: u32, signed_raw_tx: &str) -> Result<String, DomainError> {
        let result = self
            .rpc_call(chain_id, "eth_sendRawTransaction", json!([signed_raw_tx]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DomainError::Transient("eth_sendRawTransaction returned no hash".into()))
    }
}

#[async_trait::async_trait]
impl ChainSender for EvmSender {
    async fn chain_nonce(&self, chain_id: u32, sender_address: &str) -> Result<u64, DomainError> {
        let result = self
            .rpc_call(chain_id, "eth_getTransactionCount", json!([sender_address, "pending"]))
            .await?;
        let hex = result.as_str().ok_or_else(|| DomainError::Transient("nonce response not a string".into()))?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| DomainError::Transient(format!("bad nonce hex '{hex}': {e}")))
    }

    async fn submit(
        &self,
        chain_id: u32,
        tx: &PendingTransactionData,
        nonce: u64,
    ) -> Result<String, DomainError> {
        let signed = self
            .kms
            .sign(
                "/sign/evm",
                json!({
                    "chain_id": chain_id,
                    "from": tx.sender_address,
                    "to": tx.to_address,
                    "data": tx.calldata,
                    "value": tx.value.to_string(),
                    "nonce": nonce,
                    "gas_bump_count": 0,
                }),
            )
            .await?;
        self.submit_signed(chain_id, &signed).await
    }

    async fn confirm(&self, chain_id: u32, tx_hash: &str) -> Result<TxConfirmation, DomainError> {
        let result = self
            .rpc_call(chain_id, "eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(TxConfirmation::Pending);
        }
        match result.get("status").and_then(Value::as_str) {
            Some("0x1") => Ok(TxConfirmation::Success),
            Some("0x0") => Ok(TxConfirmation::Reverted("receipt status 0x0".into())),
            _ => Ok(TxConfirmation::Pending),
        }
    }

    async fn rebroadcast(
        &self,
        chain_id: u32,
        tx: &PendingTransactionData,
        nonce: u64,
        gas_bump_count: u32,
    ) -> Result<String, DomainError> {
        let signed = self
            .kms
            .sign(
                "/sign/evm",
                json!({
                    "chain_id": chain_id,
                    "from": tx.sender_address,
                    "to": tx.to_address,
                    "data": tx.calldata,
                    "value": tx.value.to_string(),
                    "nonce": nonce,
                    "gas_bump_count": gas_bump_count,
                }),
            )
            .await?;
        self.submit_signed(chain_id, &signed).await
    }
}

/// TRON signing needs the vendor TronWeb/TronGrid SDK, out of scope here
/// (spec §1). This stub keeps the trait boundary real so `TransactionQueue`
/// never special-cases chains; swapping in a working TRON sender is a
/// drop-in replacement of this one type.
pub struct TronSenderStub;

#[async_trait::async_trait]
impl ChainSender for TronSenderStub {
    async fn chain_nonce(&self, _chain_id: u32, _sender_address: &str) -> Result<u64, DomainError> {
        Err(DomainError::Fatal("TRON signing not implemented".into()))
    }

    async fn submit(
        &self,
        _chain_id: u32,
        _tx: &PendingTransactionData,
        _nonce: u64,
    ) -> Result<String, DomainError> {
        Err(DomainError::Fatal("TRON signing not implemented".into()))
    }

    async fn confirm(&self, _chain_id: u32, _tx_hash: &str) -> Result<TxConfirmation, DomainError> {
        Err(DomainError::Fatal("TRON signing not implemented".into()))
    }

    async fn rebroadcast(
        &self,
        _chain_id: u32,
        _tx: &PendingTransactionData,
        _nonce: u64,
        _gas_bump_count: u32,
    ) -> Result<String, DomainError> {
        Err(DomainError::Fatal("TRON signing not implemented".into()))
    }
}
