//! Genesis specification and the initial state image.

use super::config::ChainConfig;
use super::types::Block;
use crate::state::{IntraBlockState, StateError, NOOP_READER};
use alloy_consensus::Header;
use alloy_primitives::{Address, Bytes, B256, B64, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Base fee of the genesis block when London is active from block 0.
pub const INITIAL_BASE_FEE: u64 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("invalid genesis json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("genesis state: {0}")]
    State(#[from] StateError),
}

/// Pre-funded account of the genesis allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(default)]
    pub balance: U256,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub code: Bytes,
    #[serde(default)]
    pub storage: BTreeMap<B256, B256>,
}

impl GenesisAccount {
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }
}

/// Chain configuration together with the header fields and allocation of
/// block 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub config: ChainConfig,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub extra_data: Bytes,
    pub gas_limit: u64,
    #[serde(default)]
    pub difficulty: U256,
    #[serde(default)]
    pub mix_hash: B256,
    #[serde(default)]
    pub coinbase: Address,
    #[serde(default)]
    pub base_fee_per_gas: Option<u64>,
    #[serde(default)]
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

impl Genesis {
    pub fn from_json(json: &str) -> Result<Self, GenesisError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn header(&self) -> Header {
        let base_fee_per_gas = self
            .config
            .is_london(0)
            .then(|| self.base_fee_per_gas.unwrap_or(INITIAL_BASE_FEE));
        Header {
            number: 0,
            nonce: B64::new(self.nonce.to_be_bytes()),
            timestamp: self.timestamp,
            extra_data: self.extra_data.clone(),
            gas_limit: self.gas_limit,
            difficulty: self.difficulty,
            mix_hash: self.mix_hash,
            beneficiary: self.coinbase,
            base_fee_per_gas,
            ..Default::default()
        }
    }

    /// Builds block 0 and the state image of the allocation.
    ///
    /// The image is built over an empty world; every allocated account is
    /// created explicitly, so accounts without balance, nonce or code are
    /// part of it as well.
    pub fn to_block(&self) -> Result<(Block, IntraBlockState<'static>), GenesisError> {
        let mut ibs = IntraBlockState::new(&NOOP_READER);
        for (address, account) in &self.alloc {
            let contract = !account.code.is_empty() || !account.storage.is_empty();
            ibs.create_account(*address, contract)?;
            ibs.set_balance(*address, account.balance)?;
            ibs.set_nonce(*address, account.nonce)?;
            if !account.code.is_empty() {
                ibs.set_code(*address, account.code.clone())?;
            }
            for (slot, value) in &account.storage {
                ibs.set_state(*address, *slot, U256::from_be_bytes(value.0))?;
            }
        }
        ibs.soft_finalise();
        Ok((Block::new(self.header(), Vec::new(), Vec::new()), ibs))
    }
}
