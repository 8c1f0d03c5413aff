//! Intent helpers (spec §3, §4.5, §6): the prover's withdraw-proof request
//! wants the AssetToken variant's `asset_id` decoded into
//! `chain_id`/`adapter_id`/`token_id`, not the raw bytes32. The deprecated
//! "preferred chain" field from the original system (spec §9 Open
//! Questions) is intentionally absent from `db::models::Intent`.

use crate::chain::asset_id::AssetId;
use crate::db::models::Intent;
use crate::error::DomainError;

/// What the prover's `WithdrawProofRequest.intent` field actually needs.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProverIntent {
    RawToken {
        beneficiary_hex: String,
        token_symbol: String,
    },
    AssetToken {
        beneficiary_hex: String,
        chain_id: u32,
        adapter_id: u32,
        token_id: u16,
        asset_token_symbol: String,
    },
}

pub fn to_prover_intent(intent: &Intent) -> Result<ProverIntent, DomainError> {
    Ok(match intent {
        Intent::RawToken { beneficiary, token_symbol } => ProverIntent::RawToken {
            beneficiary_hex: beneficiary.to_hex(),
            token_symbol: token_symbol.clone(),
        },
        Intent::AssetToken { asset_id, beneficiary, asset_token_symbol } => {
            let decoded = AssetId::decode(asset_id)
                .map_err(|e| DomainError::Invalid(format!("bad asset_id: {e}")))?;
            ProverIntent::AssetToken {
                beneficiary_hex: beneficiary.to_hex(),
                chain_id: decoded.chain_id,
                adapter_id: decoded.adapter_id,
                token_id: decoded.token_id,
                asset_token_symbol: asset_token_symbol.clone(),
            }
        }
    })
}
