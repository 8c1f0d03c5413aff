//! Universal Address codec (spec §3, §4.1, §6, §8).
//!
//! A `UniversalAddress` is 32 bytes: `{chain_id: u32 SLIP-44, data: [u8; 32]}`.
//! For EVM chains bytes 0..12 of `data` are zero and 12..32 hold the 20-byte
//! address. For TRON, `data` is built from the Base58Check-decoded address
//! the same way. The wire form is `0x` + 64 lowercase hex chars.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const TRON_VERSION_BYTE: u8 = 0x41;
pub const TRON_SLIP44_CHAIN_ID: u32 = 195;
const TRON_MIN_BASE58_LEN: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "UniversalAddressWire", try_from = "UniversalAddressWire")]
pub struct UniversalAddress {
    pub chain_id: u32,
    pub data: [u8; 32],
}

impl UniversalAddress {
    pub fn new(chain_id: u32, data: [u8; 32]) -> Self {
        Self { chain_id, data }
    }

    /// `0x` + 64 lowercase hex chars.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.data))
    }

    pub fn from_hex(chain_id: u32, hex_str: &str) -> Result<Self, AddressError> {
        let data = evm_to_universal(hex_str)?;
        Ok(Self { chain_id, data })
    }
}

/// Wire shape for `UniversalAddress`: `chain_id` alongside the `0x` + 64-hex
/// form from spec §6, rather than the bare hex string alone, since the
/// struct itself carries a chain id no wire-form hex string encodes.
#[derive(Serialize, Deserialize)]
struct UniversalAddressWire {
    chain_id: u32,
    address: String,
}

impl From<UniversalAddress> for UniversalAddressWire {
    fn from(addr: UniversalAddress) -> Self {
        Self { chain_id: addr.chain_id, address: addr.to_hex() }
    }
}

impl TryFrom<UniversalAddressWire> for UniversalAddress {
    type Error = AddressError;

    fn try_from(wire: UniversalAddressWire) -> Result<Self, Self::Error> {
        let body = wire
            .address
            .strip_prefix("0x")
            .ok_or_else(|| AddressError::InvalidPrefix("expected 0x prefix".into()))?;
        if body.len() != 64 {
            return Err(AddressError::InvalidLength(format!("expected 64 hex chars, got {}", body.len())));
        }
        let bytes = hex::decode(body).map_err(|e| AddressError::InvalidLength(format!("not valid hex: {e}")))?;
        let mut data = [0u8; 32];
        data.copy_from_slice(&bytes);
        Ok(UniversalAddress::new(wire.chain_id, data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidLength(String),
    InvalidPrefix(String),
    InvalidBase58(String),
    InvalidChecksum(String),
    InvalidVersionByte(String),
    NonZeroPadding(String),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength(m) => write!(f, "invalid length: {m}"),
            AddressError::InvalidPrefix(m) => write!(f, "invalid prefix: {m}"),
            AddressError::InvalidBase58(m) => write!(f, "invalid base58: {m}"),
            AddressError::InvalidChecksum(m) => write!(f, "invalid checksum: {m}"),
            AddressError::InvalidVersionByte(m) => write!(f, "invalid version byte: {m}"),
            AddressError::NonZeroPadding(m) => write!(f, "non-zero padding: {m}"),
        }
    }
}

impl std::error::Error for AddressError {}

/// `0x` + 40 hex chars (20-byte EVM address).
pub fn is_evm_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|body| body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// TRON Base58Check address: alphabet excludes `0OIl`, minimum length 34,
/// begins with 'T' once decoded version byte is 0x41 (we check structurally
/// here; full validation happens in `tron_to_universal`).
pub fn is_tron_address(s: &str) -> bool {
    if s.len() < TRON_MIN_BASE58_LEN {
        return false;
    }
    s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// `0x` + 64 hex chars.
pub fn is_universal_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|body| body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Normalizes a chain-native address string to a `UniversalAddress` for the
/// given SLIP-44 chain id, choosing the EVM or TRON codec based on
/// `is_evm`. No silent corrections: malformed input is always an error.
pub fn normalize_address_for_chain(
    addr: &str,
    chain_id: u32,
    is_evm: bool,
) -> Result<UniversalAddress, AddressError> {
    if is_evm {
        Ok(UniversalAddress::new(chain_id, evm_to_universal(addr)?))
    } else {
        let data = tron_to_universal(addr)?;
        Ok(UniversalAddress::new(chain_id, data))
    }
}

/// `EvmToUniversal(hex) -> 32 bytes`. First 12 bytes zero, low 20 bytes the
/// address.
pub fn evm_to_universal(hex_str: &str) -> Result<[u8; 32], AddressError> {
    let body = hex_str
        .strip_prefix("0x")
        .ok_or_else(|| AddressError::InvalidPrefix("expected 0x prefix".into()))?;
    if body.len() != 40 {
        return Err(AddressError::InvalidLength(format!(
            "expected 40 hex chars, got {}",
            body.len()
        )));
    }
    let bytes = hex::decode(body)
        .map_err(|e| AddressError::InvalidLength(format!("not valid hex: {e}")))?;
    let mut data = [0u8; 32];
    data[12..32].copy_from_slice(&bytes);
    Ok(data)
}

/// `ExtractEvmFromUniversal(32 bytes) -> hex`. Strict mode rejects a
/// non-zero high-12-byte region (spec §8 says to test both policies; the
/// strict codec is the default since it catches malformed/foreign-chain
/// data instead of silently truncating it).
pub fn extract_evm_from_universal(data: &[u8; 32]) -> Result<String, AddressError> {
    extract_evm_from_universal_with_policy(data, true)
}

/// Lenient variant: always returns the low 20 bytes regardless of the high
/// 12 bytes' content.
pub fn extract_evm_from_universal_lenient(data: &[u8; 32]) -> String {
    extract_evm_from_universal_with_policy(data, false)
        .expect("lenient policy never errors")
}

fn extract_evm_from_universal_with_policy(
    data: &[u8; 32],
    strict: bool,
) -> Result<String, AddressError> {
    if strict && data[0..12].iter().any(|&b| b != 0) {
        return Err(AddressError::NonZeroPadding(
            "high 12 bytes of universal address are non-zero".into(),
        ));
    }
    Ok(format!("0x{}", hex::encode(&data[12..32])))
}

/// `TronToUniversal(base58) -> 32 bytes`. Decodes Base58Check, validates the
/// version byte (0x41) and the double-SHA256 4-byte checksum, and encodes
/// the 20-byte address into the low 20 bytes of a 32-byte buffer (the
/// TRON-specific chain_id=195 is applied by the caller/`normalize_address_for_chain`).
pub fn tron_to_universal(base58: &str) -> Result<[u8; 32], AddressError> {
    if base58.len() < TRON_MIN_BASE58_LEN {
        return Err(AddressError::InvalidLength(format!(
            "TRON address must be at least {TRON_MIN_BASE58_LEN} chars, got {}",
            base58.len()
        )));
    }
    let decoded = bs58::decode(base58)
        .into_vec()
        .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
    if decoded.len() != 25 {
        return Err(AddressError::InvalidLength(format!(
            "decoded TRON address must be 25 bytes, got {}",
            decoded.len()
        )));
    }
    let (payload, checksum) = decoded.split_at(21);
    if payload[0] != TRON_VERSION_BYTE {
        return Err(AddressError::InvalidVersionByte(format!(
            "expected 0x{TRON_VERSION_BYTE:02x}, got 0x{:02x}",
            payload[0]
        )));
    }
    let expected_checksum = double_sha256(payload);
    if &expected_checksum[0..4] != checksum {
        return Err(AddressError::InvalidChecksum(
            "double-SHA256 checksum mismatch".into(),
        ));
    }
    let mut data = [0u8; 32];
    data[12..32].copy_from_slice(&payload[1..21]);
    Ok(data)
}

/// `EvmToTronBase58(hex) -> base58`. Treats the low 20 bytes of the EVM hex
/// string as a TRON address body, prefixes the 0x41 version byte, appends
/// the double-SHA256 checksum, and Base58-encodes the result.
pub fn evm_to_tron_base58(hex_str: &str) -> Result<String, AddressError> {
    let body = hex_str
        .strip_prefix("0x")
        .ok_or_else(|| AddressError::InvalidPrefix("expected 0x prefix".into()))?;
    if body.len() != 40 {
        return Err(AddressError::InvalidLength(format!(
            "expected 40 hex chars, got {}",
            body.len()
        )));
    }
    let addr_bytes =
        hex::decode(body).map_err(|e| AddressError::InvalidLength(format!("not valid hex: {e}")))?;
    let mut payload = Vec::with_capacity(21);
    payload.push(TRON_VERSION_BYTE);
    payload.extend_from_slice(&addr_bytes);
    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum[0..4]);
    Ok(bs58::encode(payload).into_string())
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}
