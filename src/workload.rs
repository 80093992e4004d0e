//! Deterministic chain generation: funded accounts and blocks of signed
//! transfers on top of a genesis.

use crate::chain::{genesis::INITIAL_BASE_FEE, Block, ChainConfig, Genesis, GenesisAccount, SignerError, TxRequest};
use alloy_consensus::Header;
use alloy_primitives::{keccak256, Address, TxKind, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Balance of every generated account at genesis (1000 ETH).
pub const INITIAL_BALANCE: u128 = 1_000_000_000_000_000_000_000;

/// Value of each generated transfer (0.001 ETH).
pub const TRANSFER_VALUE: u64 = 1_000_000_000_000_000;

const TRANSFER_GAS: u64 = 21_000;
const BLOCK_GAS_LIMIT: u64 = 30_000_000;
const BLOCK_TIME: u64 = 12;

// ============================================================================
// Accounts
// ============================================================================

/// A funded externally owned account of the workload.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(key: SigningKey) -> Self {
        // Uncompressed SEC1 point without its 0x04 tag.
        let point = VerifyingKey::from(&key).to_encoded_point(false);
        let address = Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..]);
        Self {
            signing_key: key,
            address,
        }
    }

    /// Same seed, same key.
    pub fn from_seed(seed: u64) -> Self {
        Self::from_signing_key(SigningKey::random(&mut StdRng::seed_from_u64(seed)))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account({})", self.address)
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Shape of a generated chain.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub num_blocks: usize,
    pub txs_per_block: usize,
    /// Share of transfers drawn from a shrinking hot set of accounts; at 1.0
    /// every transfer is between the first two accounts.
    pub conflict_factor: f64,
    pub seed: u64,
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_blocks: 10,
            txs_per_block: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

/// A generated chain: genesis allocation and blocks of pre-signed transfers.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub genesis: Genesis,
    /// Blocks 1..=num_blocks, each linked to its parent.
    pub blocks: Vec<Block>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a workload on a chain with every fork active from genesis.
    pub fn generate(config: WorkloadConfig) -> Result<Self, SignerError> {
        let chain = ChainConfig::all_forks(config.chain_id);
        Self::generate_on(config, chain)
    }

    /// Generates a workload on `chain`. Its chain id overrides the one in
    /// `config`.
    pub fn generate_on(mut config: WorkloadConfig, chain: ChainConfig) -> Result<Self, SignerError> {
        config.chain_id = chain.chain_id;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let accounts: Vec<Account> = (0..config.num_accounts as u64)
            .map(|offset| Account::from_seed(config.seed.wrapping_add(offset)))
            .collect();
        let genesis = Self::genesis(chain, &accounts);

        let hot = hot_set_size(config.num_accounts, config.conflict_factor);
        let mut nonces = HashMap::<usize, u64>::new();
        let mut parent = genesis.header();
        let mut blocks = Vec::with_capacity(config.num_blocks);
        for number in 1..=config.num_blocks as u64 {
            let mut transactions = Vec::with_capacity(config.txs_per_block);
            for _ in 0..config.txs_per_block {
                let range = if rng.gen::<f64>() < config.conflict_factor {
                    hot
                } else {
                    config.num_accounts
                };
                let (from, to) = pick_pair(&mut rng, range);
                let nonce = nonces.entry(from).or_insert(0);
                let tx = TxRequest {
                    chain_id: Some(config.chain_id),
                    nonce: *nonce,
                    gas_price: u128::from(INITIAL_BASE_FEE) * 2,
                    gas_limit: TRANSFER_GAS,
                    to: TxKind::Call(accounts[to].address),
                    value: U256::from(TRANSFER_VALUE),
                    ..Default::default()
                }
                .sign(&accounts[from].signing_key)?;
                *nonce += 1;
                transactions.push(tx);
            }

            let header = Header {
                parent_hash: parent.hash_slow(),
                number,
                beneficiary: coinbase(number),
                gas_limit: BLOCK_GAS_LIMIT,
                gas_used: TRANSFER_GAS * transactions.len() as u64,
                timestamp: parent.timestamp + BLOCK_TIME,
                base_fee_per_gas: genesis.config.is_london(number).then_some(INITIAL_BASE_FEE),
                ..Default::default()
            };
            parent = header.clone();
            blocks.push(Block::new(header, transactions, Vec::new()));
        }

        Ok(Self {
            accounts,
            genesis,
            blocks,
            config,
        })
    }

    fn genesis(chain: ChainConfig, accounts: &[Account]) -> Genesis {
        let alloc: BTreeMap<Address, GenesisAccount> = accounts
            .iter()
            .map(|account| {
                (
                    account.address,
                    GenesisAccount::with_balance(U256::from(INITIAL_BALANCE)),
                )
            })
            .collect();
        Genesis {
            config: chain,
            gas_limit: BLOCK_GAS_LIMIT,
            alloc,
            ..Default::default()
        }
    }

    pub fn num_transactions(&self) -> usize {
        self.blocks.iter().map(|block| block.transactions.len()).sum()
    }
}

/// Fee recipient of block `number`; a handful of miners take turns.
pub fn coinbase(number: u64) -> Address {
    Address::with_last_byte(0xc0 + (number % 4) as u8)
}

/// Number of leading accounts conflicting transfers are drawn from.
fn hot_set_size(num_accounts: usize, conflict_factor: f64) -> usize {
    if conflict_factor <= 0.0 {
        return num_accounts;
    }
    let spread = (1.0 - conflict_factor) * num_accounts.saturating_sub(2) as f64;
    (2 + spread as usize).min(num_accounts)
}

/// Distinct sender and receiver indices below `range`. With fewer than two
/// accounts the only account pays itself.
fn pick_pair(rng: &mut StdRng, range: usize) -> (usize, usize) {
    if range < 2 {
        return (0, 0);
    }
    let from = rng.gen_range(0..range);
    let mut to = rng.gen_range(0..range);
    while to == from {
        to = rng.gen_range(0..range);
    }
    (from, to)
}

// ============================================================================
// Tests
// ============================================================================
