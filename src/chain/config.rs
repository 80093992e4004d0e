//! Chain configuration and the protocol rules derived from it.

use alloy_primitives::{Address, Bytes};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Fork schedule and consensus settings of a chain.
///
/// Fork activations are block numbers; `None` means the fork never activates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub homestead_block: Option<u64>,
    #[serde(default)]
    pub dao_fork_block: Option<u64>,
    #[serde(default)]
    pub dao_fork_support: bool,
    /// Accounts drained into the DAO refund contract at the DAO fork.
    #[serde(default)]
    pub dao_drain_list: Vec<Address>,
    #[serde(default)]
    pub eip150_block: Option<u64>,
    #[serde(default)]
    pub eip155_block: Option<u64>,
    #[serde(default)]
    pub eip158_block: Option<u64>,
    #[serde(default)]
    pub byzantium_block: Option<u64>,
    #[serde(default)]
    pub constantinople_block: Option<u64>,
    #[serde(default)]
    pub petersburg_block: Option<u64>,
    #[serde(default)]
    pub istanbul_block: Option<u64>,
    #[serde(default)]
    pub berlin_block: Option<u64>,
    #[serde(default)]
    pub london_block: Option<u64>,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

/// Consensus engine selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "engine")]
pub enum ConsensusConfig {
    #[default]
    Ethash,
    Posa(PosaConfig),
}

/// Proof-of-staked-authority settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosaConfig {
    /// Built-in system contract code replaced at the given block numbers.
    #[serde(default, deserialize_with = "block_keyed")]
    pub upgrades: BTreeMap<u64, Vec<ContractUpgrade>>,
}

/// Code installed at a system contract address by an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUpgrade {
    pub address: Address,
    pub code: Bytes,
}

/// Reads a map keyed by decimal block numbers.
///
/// JSON object keys are strings, and inside the tagged consensus section
/// they reach us already buffered as strings, so they are parsed here.
fn block_keyed<'de, D, V>(deserializer: D) -> Result<BTreeMap<u64, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    BTreeMap::<String, V>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            key.parse::<u64>()
                .map(|number| (number, value))
                .map_err(|_| de::Error::custom(format!("invalid block number {key:?}")))
        })
        .collect()
}

fn active(fork: Option<u64>, number: u64) -> bool {
    fork.is_some_and(|block| block <= number)
}

impl ChainConfig {
    /// A configuration with every supported fork active from genesis.
    pub fn all_forks(chain_id: u64) -> Self {
        Self {
            chain_id,
            homestead_block: Some(0),
            eip150_block: Some(0),
            eip155_block: Some(0),
            eip158_block: Some(0),
            byzantium_block: Some(0),
            constantinople_block: Some(0),
            petersburg_block: Some(0),
            istanbul_block: Some(0),
            berlin_block: Some(0),
            london_block: Some(0),
            ..Default::default()
        }
    }

    pub fn is_homestead(&self, number: u64) -> bool {
        active(self.homestead_block, number)
    }

    pub fn is_eip155(&self, number: u64) -> bool {
        active(self.eip155_block, number)
    }

    pub fn is_byzantium(&self, number: u64) -> bool {
        active(self.byzantium_block, number)
    }

    pub fn is_constantinople(&self, number: u64) -> bool {
        active(self.constantinople_block, number)
    }

    pub fn is_london(&self, number: u64) -> bool {
        active(self.london_block, number)
    }

    /// Whether the DAO hard-fork state change runs at `number`.
    pub fn is_dao_fork_block(&self, number: u64) -> bool {
        self.dao_fork_support && self.dao_fork_block == Some(number)
    }

    pub fn is_posa(&self) -> bool {
        matches!(self.consensus, ConsensusConfig::Posa(_))
    }

    pub fn posa(&self) -> Option<&PosaConfig> {
        match &self.consensus {
            ConsensusConfig::Posa(config) => Some(config),
            ConsensusConfig::Ethash => None,
        }
    }

    /// Protocol rules in effect at block `number`.
    pub fn rules(&self, number: u64) -> Rules {
        Rules {
            chain_id: self.chain_id,
            is_homestead: self.is_homestead(number),
            is_tangerine_whistle: active(self.eip150_block, number),
            is_spurious_dragon: active(self.eip158_block, number),
            is_byzantium: self.is_byzantium(number),
            is_constantinople: self.is_constantinople(number),
            is_petersburg: active(self.petersburg_block, number),
            is_istanbul: active(self.istanbul_block, number),
            is_berlin: active(self.berlin_block, number),
            is_london: self.is_london(number),
        }
    }
}

/// Snapshot of the fork flags active at one block.
///
/// The default value has every flag off; genesis is processed with it so
/// that empty accounts are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rules {
    pub chain_id: u64,
    pub is_homestead: bool,
    pub is_tangerine_whistle: bool,
    pub is_spurious_dragon: bool,
    pub is_byzantium: bool,
    pub is_constantinople: bool,
    pub is_petersburg: bool,
    pub is_istanbul: bool,
    pub is_berlin: bool,
    pub is_london: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_follow_fork_schedule() {
        let config = ChainConfig {
            chain_id: 5,
            homestead_block: Some(0),
            eip158_block: Some(10),
            london_block: Some(20),
            ..Default::default()
        };

        let early = config.rules(3);
        assert!(early.is_homestead);
        assert!(!early.is_spurious_dragon);
        assert!(!early.is_london);

        let late = config.rules(20);
        assert!(late.is_spurious_dragon);
        assert!(late.is_london);
        assert_eq!(late.chain_id, 5);
        assert!(!late.is_berlin);
    }

    #[test]
    fn test_dao_fork_requires_support() {
        let mut config = ChainConfig {
            dao_fork_block: Some(7),
            ..Default::default()
        };
        assert!(!config.is_dao_fork_block(7));

        config.dao_fork_support = true;
        assert!(config.is_dao_fork_block(7));
        assert!(!config.is_dao_fork_block(8));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "chainId": 56,
            "londonBlock": 0,
            "consensus": {
                "engine": "posa",
                "upgrades": {
                    "3": [{ "address": "0x0000000000000000000000000000000000001000", "code": "0x6000" }]
                }
            }
        }"#;

        let config: ChainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chain_id, 56);
        assert!(config.is_posa());
        let upgrades = &config.posa().unwrap().upgrades[&3];
        assert_eq!(upgrades[0].code.as_ref(), &[0x60, 0x00]);
        assert!(config.rules(1).is_london);

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ChainConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_upgrade_keys_must_be_block_numbers() {
        let json = r#"{
            "chainId": 56,
            "consensus": { "engine": "posa", "upgrades": { "soon": [] } }
        }"#;
        let err = serde_json::from_str::<ChainConfig>(json).unwrap_err();
        assert!(err.to_string().contains("invalid block number"));

        let json = r#"{ "chainId": 56, "consensus": { "engine": "posa" } }"#;
        let config: ChainConfig = serde_json::from_str(json).unwrap();
        assert!(config.posa().unwrap().upgrades.is_empty());
    }
}
