//! HTTP client for the read-side scanner API (spec §6 "Scanner HTTP API").
//! Same stateless-`reqwest::Client` shape as `prover::client::ProverClient`
//! — the reconciler calls one method per expected fact.

use serde::Deserialize;

use crate::error::DomainError;

pub struct ScannerClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRecord {
    #[serde(rename = "depositId")]
    pub deposit_id: String,
    #[serde(rename = "grossAmount")]
    pub gross_amount: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommitmentExistsResponse {
    exists: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct NullifierUsedResponse {
    used: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerEventRecord {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ScannerEventsResponse {
    #[serde(default)]
    events: Vec<ScannerEventRecord>,
}

impl ScannerClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub async fn deposit(&self, chain_id: u32, local_deposit_id: &str) -> Result<Option<DepositRecord>, DomainError> {
        let url = format!("{}/api/data/deposit/{chain_id}/{local_deposit_id}", self.base_url);
        self.get_optional(&url).await
    }

    pub async fn commitment_exists(&self, chain_id: u32, commitment_hex: &str) -> Result<bool, DomainError> {
        let url = format!("{}/api/data/commitment/exists?chainId={chain_id}&commitment={commitment_hex}", self.base_url);
        let resp: CommitmentExistsResponse = self.get(&url).await?;
        Ok(resp.exists)
    }

    pub async fn nullifier_used(&self, chain_id: u32, nullifier_hex: &str) -> Result<bool, DomainError> {
        let url = format!("{}/api/data/nullifier/used?chainId={chain_id}&nullifierHash={nullifier_hex}", self.base_url);
        let resp: NullifierUsedResponse = self.get(&url).await?;
        Ok(resp.used)
    }

    /// Looks for a matching event by contract/event name and an arbitrary
    /// filter (e.g. `nullifier=0x..`, `txHash=0x..`); returns the first hit.
    pub async fn find_event(
        &self,
        chain_id: u32,
        contract: &str,
        event: &str,
        filter: &str,
    ) -> Result<Option<ScannerEventRecord>, DomainError> {
        let url = format!(
            "{}/api/data/events?chainId={chain_id}&contract={contract}&event={event}&{filter}",
            self.base_url
        );
        let resp: ScannerEventsResponse = self.get(&url).await?;
        Ok(resp.events.into_iter().next())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, DomainError> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(DomainError::External(format!("scanner returned {}: {url}", resp.status())));
        }
        resp.json::<T>().await.map_err(DomainError::from)
    }

    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<Option<T>, DomainError> {
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(DomainError::External(format!("scanner returned {}: {url}", resp.status())));
        }
        resp.json::<T>().await.map(Some).map_err(DomainError::from)
    }
}
