//! Chain data: configuration, genesis, blocks and their metadata encoding.

pub mod config;
pub mod genesis;
pub mod rawdb;
pub mod types;

pub use config::{ChainConfig, ConsensusConfig, ContractUpgrade, PosaConfig, Rules};
pub use genesis::{Genesis, GenesisAccount, GenesisError};
pub use types::{Block, Message, SignedTransaction, Signer, SignerError, TxRequest};
