//! AssetID encoding (spec §6): bytes32 = u32 chain_id (SLIP-44) ‖ u32
//! adapter_id ‖ u16 token_id ‖ 22 bytes zero.

use super::address::AddressError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetId {
    pub chain_id: u32,
    pub adapter_id: u32,
    pub token_id: u16,
}

impl AssetId {
    pub fn encode(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&self.chain_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.adapter_id.to_be_bytes());
        out[8..10].copy_from_slice(&self.token_id.to_be_bytes());
        out
    }

    /// Inverse of `encode`. Rejects non-zero padding in bytes 10..32.
    pub fn decode(bytes: &[u8; 32]) -> Result<Self, AddressError> {
        if bytes[10..32].iter().any(|&b| b != 0) {
            return Err(AddressError::NonZeroPadding(
                "asset id padding bytes 10..32 must be zero".into(),
            ));
        }
        let chain_id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let adapter_id = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let token_id = u16::from_be_bytes(bytes[8..10].try_into().unwrap());
        Ok(Self {
            chain_id,
            adapter_id,
            token_id,
        })
    }
}
