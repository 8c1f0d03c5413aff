//! Normalizes the three wire envelope shapes spec'd for NATS delivery
//! (canonical typed event JSON, `ScannerEventNotification`, and the
//! configurable envelope) into one shape every handler in `consumer`
//! works from.

use serde::Deserialize;
use serde_json::Value;

use crate::chain::registry::{ChainRegistry, DEFAULT_CHAIN_ID};

/// The canonical shape, regardless of which wire envelope it arrived in.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub chain_id: u32,
    pub contract: String,
    pub event_name: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub data: Value,
}

/// Numeric id fields must accept both string and integer wire forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumericId {
    Int(u64),
    Str(String),
}

impl NumericId {
    fn as_u64(&self) -> Option<u64> {
        match self {
            NumericId::Int(n) => Some(*n),
            NumericId::Str(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScannerEventNotification {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "contractAddr")]
    contract_addr: String,
    #[serde(rename = "txHash")]
    tx_hash: String,
    #[serde(rename = "blockNumber")]
    block_number: NumericId,
    #[serde(rename = "logIndex")]
    log_index: NumericId,
    #[serde(rename = "eventData")]
    event_data: Value,
}

#[derive(Debug, Deserialize)]
struct ConfigurableEventNotification {
    chain: Option<String>,
    contract: String,
    event: String,
    data: Value,
    #[serde(rename = "blockNumber")]
    block_number: NumericId,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "logIndex")]
    log_index: NumericId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    Unrecognized(String),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Unrecognized(m) => write!(f, "payload did not match any known envelope shape: {m}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Parses `payload` into a `NormalizedEvent`. `subject_chain_segment` is the
/// chain slug from the NATS subject (`zkpay.<slug>.Contract.Event`), used as
/// the second-priority chain-id source (spec §4.3).
pub fn normalize(
    registry: &ChainRegistry,
    payload: &[u8],
    subject_contract: &str,
    subject_event: &str,
    subject_chain_segment: &str,
) -> Result<NormalizedEvent, EnvelopeError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| EnvelopeError::Unrecognized(format!("not valid JSON: {e}")))?;

    if let Ok(scanner) = serde_json::from_value::<ScannerEventNotification>(value.clone()) {
        let chain_hint = scanner_chain_hint(&scanner.event_data);
        let chain_id = derive_chain_id(registry, chain_hint.as_deref(), subject_chain_segment);
        return Ok(NormalizedEvent {
            chain_id,
            contract: contract_name_from_address(&scanner.contract_addr, subject_contract),
            event_name: scanner.event_name,
            tx_hash: scanner.tx_hash,
            log_index: scanner.log_index.as_u64().unwrap_or(0),
            block_number: scanner.block_number.as_u64().unwrap_or(0),
            data: scanner.event_data,
        });
    }

    if let Ok(configurable) = serde_json::from_value::<ConfigurableEventNotification>(value.clone()) {
        let chain_hint = configurable.chain.clone().or_else(|| chain_hint_from_data(&configurable.data));
        let chain_id = derive_chain_id(registry, chain_hint.as_deref(), subject_chain_segment);
        return Ok(NormalizedEvent {
            chain_id,
            contract: configurable.contract,
            event_name: configurable.event,
            tx_hash: configurable.transaction_hash,
            log_index: configurable.log_index.as_u64().unwrap_or(0),
            block_number: configurable.block_number.as_u64().unwrap_or(0),
            data: configurable.data,
        });
    }

    // Canonical typed event JSON: the subject already names contract/event,
    // the body carries the rest under its own field names.
    let obj = value
        .as_object()
        .ok_or_else(|| EnvelopeError::Unrecognized("expected a JSON object".into()))?;
    let tx_hash = obj
        .get("txHash")
        .or_else(|| obj.get("transactionHash"))
        .and_then(Value::as_str)
        .ok_or_else(|| EnvelopeError::Unrecognized("missing txHash/transactionHash".into()))?
        .to_string();
    let log_index = obj
        .get("logIndex")
        .and_then(numeric_field)
        .ok_or_else(|| EnvelopeError::Unrecognized("missing logIndex".into()))?;
    let block_number = obj.get("blockNumber").and_then(numeric_field).unwrap_or(0);
    let chain_hint = chain_hint_from_data(&value);
    let chain_id = derive_chain_id(registry, chain_hint.as_deref(), subject_chain_segment);

    Ok(NormalizedEvent {
        chain_id,
        contract: subject_contract.to_string(),
        event_name: subject_event.to_string(),
        tx_hash,
        log_index,
        block_number,
        data: value,
    })
}

fn numeric_field(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `ScannerEventNotification`'s `eventData` carries a free-form map; chain
/// hints live under `chainId` or the nested `owner.chainId`.
fn scanner_chain_hint(event_data: &Value) -> Option<String> {
    chain_hint_from_data(event_data)
}

fn chain_hint_from_data(data: &Value) -> Option<String> {
    if let Some(v) = data.get("chainId") {
        return chain_hint_value(v);
    }
    if let Some(owner) = data.get("owner") {
        if let Some(v) = owner.get("chainId") {
            return chain_hint_value(v);
        }
    }
    None
}

fn chain_hint_value(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// `SmartToSlip44` (spec §4.3/§9): a chain hint may already be a SLIP-44 id,
/// a chain-native id, or a chain name — try each in turn.
fn smart_to_slip44(registry: &ChainRegistry, hint: &str) -> Option<u32> {
    if let Ok(n) = hint.parse::<u32>() {
        if registry.by_slip44(n).is_some() {
            return Some(n);
        }
    }
    if let Ok(n) = hint.parse::<u64>() {
        if let Some(slip44) = registry.native_to_slip44(n) {
            return Some(slip44);
        }
    }
    registry.name_to_slip44(hint)
}

fn derive_chain_id(registry: &ChainRegistry, event_hint: Option<&str>, subject_segment: &str) -> u32 {
    if let Some(hint) = event_hint {
        if let Some(slip44) = smart_to_slip44(registry, hint) {
            return slip44;
        }
    }
    if let Some(slip44) = smart_to_slip44(registry, subject_segment) {
        return slip44;
    }
    DEFAULT_CHAIN_ID
}

/// The canonical/scanner envelopes carry a raw contract address rather than
/// a logical name; the subject segment is the only place the logical
/// contract name (`Treasury`, `EnclavePay`, ...) is guaranteed to appear.
fn contract_name_from_address(_contract_addr: &str, subject_contract: &str) -> String {
    subject_contract.to_string()
}
