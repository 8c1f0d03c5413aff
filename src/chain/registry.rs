use std::collections::HashMap;

use crate::config::RelayerConfig;

/// SLIP-44 id for BSC, used as the ingestor's default chain when an event
/// carries no explicit chain id (spec §4.3).
pub const DEFAULT_CHAIN_ID: u32 = 714;

#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub slip44_chain_id: u32,
    /// The chain's own native id (e.g. EVM chain id, or TRON's network id).
    pub native_id: u64,
    pub name: &'static str,
    pub is_evm: bool,
    pub explorer_url: &'static str,
}

/// Static registry keyed by SLIP-44 id, with a parallel index by native id.
/// Built once from a fixed table; per-chain RPC endpoints come from config
/// since they are deployment-specific secrets/URLs, not chain metadata.
pub struct ChainRegistry {
    by_slip44: HashMap<u32, ChainInfo>,
    by_native: HashMap<u64, u32>,
    by_name: HashMap<&'static str, u32>,
    rpc_endpoints: HashMap<u32, String>,
}

fn static_table() -> Vec<ChainInfo> {
    vec![
        ChainInfo {
            slip44_chain_id: 714,
            native_id: 56,
            name: "bsc",
            is_evm: true,
            explorer_url: "https://bscscan.com",
        },
        ChainInfo {
            slip44_chain_id: 60,
            native_id: 1,
            name: "ethereum",
            is_evm: true,
            explorer_url: "https://etherscan.io",
        },
        ChainInfo {
            slip44_chain_id: 195,
            native_id: 728126428,
            name: "tron",
            is_evm: false,
            explorer_url: "https://tronscan.org",
        },
        ChainInfo {
            slip44_chain_id: 966,
            native_id: 137,
            name: "polygon",
            is_evm: true,
            explorer_url: "https://polygonscan.com",
        },
        ChainInfo {
            slip44_chain_id: 9001,
            native_id: 42161,
            name: "arbitrum",
            is_evm: true,
            explorer_url: "https://arbiscan.io",
        },
    ]
}

impl ChainRegistry {
    pub fn new(config: &RelayerConfig) -> Self {
        let mut by_slip44 = HashMap::new();
        let mut by_native = HashMap::new();
        let mut by_name = HashMap::new();
        for info in static_table() {
            by_native.insert(info.native_id, info.slip44_chain_id);
            by_name.insert(info.name, info.slip44_chain_id);
            by_slip44.insert(info.slip44_chain_id, info);
        }
        Self {
            by_slip44,
            by_native,
            by_name,
            rpc_endpoints: config.chain_rpc_endpoints.clone(),
        }
    }

    /// Test/standalone constructor that skips config-derived RPC endpoints.
    pub fn bare() -> Self {
        let mut by_slip44 = HashMap::new();
        let mut by_native = HashMap::new();
        let mut by_name = HashMap::new();
        for info in static_table() {
            by_native.insert(info.native_id, info.slip44_chain_id);
            by_name.insert(info.name, info.slip44_chain_id);
            by_slip44.insert(info.slip44_chain_id, info);
        }
        Self {
            by_slip44,
            by_native,
            by_name,
            rpc_endpoints: HashMap::new(),
        }
    }

    pub fn by_slip44(&self, slip44: u32) -> Option<&ChainInfo> {
        self.by_slip44.get(&slip44)
    }

    pub fn native_to_slip44(&self, native_id: u64) -> Option<u32> {
        self.by_native.get(&native_id).copied()
    }

    /// Matches a chain slug as it appears in a NATS subject segment (e.g.
    /// "bsc"), case-insensitively.
    pub fn name_to_slip44(&self, name: &str) -> Option<u32> {
        let lower = name.to_ascii_lowercase();
        self.by_name.get(lower.as_str()).copied()
    }

    pub fn is_evm(&self, slip44: u32) -> bool {
        self.by_slip44.get(&slip44).map(|c| c.is_evm).unwrap_or(false)
    }

    pub fn rpc_endpoint(&self, slip44: u32) -> Option<&str> {
        self.rpc_endpoints.get(&slip44).map(String::as_str)
    }

    pub fn explorer_url(&self, slip44: u32) -> Option<&'static str> {
        self.by_slip44.get(&slip44).map(|c| c.explorer_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_chains() {
        let reg = ChainRegistry::bare();
        assert!(reg.is_evm(714));
        assert!(!reg.is_evm(195));
        assert_eq!(reg.native_to_slip44(56), Some(714));
        assert_eq!(reg.by_slip44(195).unwrap().name, "tron");
    }

    #[test]
    fn unknown_chain_is_none() {
        let reg = ChainRegistry::bare();
        assert!(reg.by_slip44(999_999).is_none());
        assert!(reg.rpc_endpoint(714).is_none());
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let reg = ChainRegistry::bare();
        assert_eq!(reg.name_to_slip44("BSC"), Some(714));
        assert_eq!(reg.name_to_slip44("tron"), Some(195));
        assert!(reg.name_to_slip44("doesnotexist").is_none());
    }
}
