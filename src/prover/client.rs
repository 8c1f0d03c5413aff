//! HTTP client for the external prover (spec §6 "Prover HTTP API"). A
//! stateless `reqwest::Client` call per task; retries/backoff live one
//! layer up in `prover::runner`, same split as `txqueue::sender`'s KMS
//! client.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::withdraw::intent::ProverIntent;

#[derive(Debug, Clone, Serialize)]
pub struct AllocationHex {
    pub seq: u8,
    pub amount_hex32: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildCommitmentRequest {
    pub allocations: Vec<AllocationHex>,
    pub deposit_id: String,
    pub signature: String,
    pub owner_address: String,
    pub token_key: String,
    pub chain_name: Option<String>,
    pub lang: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitmentProofResponse {
    pub success: bool,
    pub proof_data: String,
    pub public_values: String,
    pub vkey: Option<String>,
    pub allocations_count: u32,
    pub total_amount: String,
    pub token_symbol: String,
    pub owner_chain_id: u32,
    pub timestamp: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitmentGroupWire {
    pub checkbook_id: String,
    pub allocations: Vec<AllocationHex>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawProofRequest {
    pub commitment_groups: Vec<CommitmentGroupWire>,
    pub owner_address: String,
    pub intent: ProverIntent,
    pub signature: String,
    pub source_token_symbol: String,
    pub lang: String,
    pub source_chain_name: Option<String>,
    pub target_chain_name: Option<String>,
    pub min_output: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawProofResponse {
    pub success: bool,
    pub proof_data: String,
    pub public_values: String,
    pub recipient_chain_id: u32,
    pub recipient_address: String,
    pub amount: String,
    pub token_key: String,
    pub commitment_root: String,
    pub nullifiers: Vec<String>,
    pub timestamp: i64,
    pub error_message: Option<String>,
}

pub struct ProverClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProverClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub async fn build_commitment(
        &self,
        req: &BuildCommitmentRequest,
    ) -> Result<CommitmentProofResponse, DomainError> {
        let resp = self
            .http
            .post(format!("{}/api/proof/commitment", self.base_url))
            .json(req)
            .send()
            .await?;
        Self::parse(resp).await
    }

    pub async fn build_withdraw_proof(
        &self,
        req: &WithdrawProofRequest,
    ) -> Result<WithdrawProofResponse, DomainError> {
        let resp = self
            .http
            .post(format!("{}/api/proof/withdraw", self.base_url))
            .json(req)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, DomainError> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DomainError::External(format!("prover returned {status}: {body}")));
        }
        resp.json::<T>().await.map_err(DomainError::from)
    }
}
