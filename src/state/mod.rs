//! World-state access for task execution.
//!
//! Execution goes through two small traits: [`StateRead`] for the values a
//! task observes and [`StateWrite`] for the changes it makes. The replay
//! implementations ([`StateReader22`], [`StateWriter22`]) sit on top of the
//! versioned overlay and record every access so the consumer can validate
//! and apply the task later. [`IntraBlockState`] caches accounts on top of a
//! reader and turns pending changes into writes.

mod account;
mod intra_block;
mod reader;
mod writer;

pub use account::{
    account_key, code_key, decode_storage_value, encode_storage_value, storage_key, Account,
};
pub use intra_block::IntraBlockState;
pub use reader::StateReader22;
pub use writer::{PriorValues, StateWriter22};

use alloy_primitives::{Address, Bytes, B256, U256};
use thiserror::Error;
use versioned_state::{KvError, Table};

/// Errors raised while reading or writing world state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("no open state transaction")]
    NoTransaction,
    #[error("cannot decode {table} entry: {reason}")]
    Decode { table: Table, reason: String },
}

impl revm::database_interface::DBErrorMarker for StateError {}

/// Read access to world state.
pub trait StateRead {
    fn read_account_data(&self, address: Address) -> Result<Option<Account>, StateError>;

    fn read_account_storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: &B256,
    ) -> Result<U256, StateError>;

    fn read_account_code(
        &self,
        address: Address,
        incarnation: u64,
        code_hash: B256,
    ) -> Result<Option<Bytes>, StateError>;

    /// Incarnation of the contract last deleted at `address`, 0 if none.
    fn read_account_incarnation(&self, address: Address) -> Result<u64, StateError>;
}

/// Write access to world state.
pub trait StateWrite {
    fn update_account_data(&mut self, address: Address, account: &Account) -> Result<(), StateError>;

    fn update_account_code(
        &mut self,
        address: Address,
        incarnation: u64,
        code: &[u8],
    ) -> Result<(), StateError>;

    fn delete_account(&mut self, address: Address) -> Result<(), StateError>;

    fn write_account_storage(
        &mut self,
        address: Address,
        incarnation: u64,
        slot: &B256,
        value: U256,
    ) -> Result<(), StateError>;
}

/// Reader over an empty world.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReader;

pub static NOOP_READER: NoopReader = NoopReader;

impl StateRead for NoopReader {
    fn read_account_data(&self, _address: Address) -> Result<Option<Account>, StateError> {
        Ok(None)
    }

    fn read_account_storage(&self, _address: Address, _incarnation: u64, _slot: &B256) -> Result<U256, StateError> {
        Ok(U256::ZERO)
    }

    fn read_account_code(
        &self,
        _address: Address,
        _incarnation: u64,
        _code_hash: B256,
    ) -> Result<Option<Bytes>, StateError> {
        Ok(None)
    }

    fn read_account_incarnation(&self, _address: Address) -> Result<u64, StateError> {
        Ok(0)
    }
}
