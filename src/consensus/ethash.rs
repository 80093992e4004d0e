use super::{ChainHeaderReader, ConsensusError, Engine, EpochStore, SystemCall};
use crate::chain::{ChainConfig, SignedTransaction};
use alloy_consensus::Header;
use alloy_primitives::{Address, U256};

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

const FRONTIER_BLOCK_REWARD: u128 = 5 * WEI_PER_ETHER;
const BYZANTIUM_BLOCK_REWARD: u128 = 3 * WEI_PER_ETHER;
const CONSTANTINOPLE_BLOCK_REWARD: u128 = 2 * WEI_PER_ETHER;

/// Proof-of-work engine. Only the block and uncle rewards touch state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ethash;

impl Ethash {
    pub fn new() -> Self {
        Self
    }

    pub fn block_reward(config: &ChainConfig, number: u64) -> U256 {
        let reward = if config.is_constantinople(number) {
            CONSTANTINOPLE_BLOCK_REWARD
        } else if config.is_byzantium(number) {
            BYZANTIUM_BLOCK_REWARD
        } else {
            FRONTIER_BLOCK_REWARD
        };
        U256::from(reward)
    }

    /// Rewards of the miner and of every uncle's miner.
    pub fn accumulate_rewards(config: &ChainConfig, header: &Header, uncles: &[Header]) -> Vec<(Address, U256)> {
        let reward = Self::block_reward(config, header.number);
        let mut miner = reward;
        let mut rewards = Vec::with_capacity(uncles.len() + 1);
        for uncle in uncles {
            let distance = U256::from((uncle.number + 8).saturating_sub(header.number));
            rewards.push((uncle.beneficiary, distance * reward / U256::from(8)));
            miner += reward / U256::from(32);
        }
        rewards.push((header.beneficiary, miner));
        rewards
    }
}

impl Engine for Ethash {
    fn name(&self) -> &'static str {
        "ethash"
    }

    fn initialize(
        &self,
        _config: &ChainConfig,
        _chain: &dyn ChainHeaderReader,
        _epoch: &dyn EpochStore,
        _header: &Header,
        _txs: &[SignedTransaction],
        _uncles: &[Header],
        _syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn finalize(
        &self,
        config: &ChainConfig,
        header: &Header,
        _txs: &[SignedTransaction],
        uncles: &[Header],
        _epoch: &dyn EpochStore,
        _chain: &dyn ChainHeaderReader,
        syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError> {
        for (address, amount) in Self::accumulate_rewards(config, header, uncles) {
            syscall.state().add_balance(address, amount)?;
        }
        Ok(())
    }
}
