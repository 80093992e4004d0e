//! Account encoding and plain-state key layout.

use super::StateError;
use alloy_primitives::{Address, B256, U256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use revm::primitives::KECCAK_EMPTY;
use versioned_state::Table;

/// Plain-state account record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    /// Bumped every time a contract is (re)created at this address, so
    /// that storage of earlier incarnations is never observed.
    pub incarnation: u64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code_hash: KECCAK_EMPTY,
            incarnation: 0,
        }
    }
}

impl Account {
    /// Empty in the EIP-161 sense: no nonce, no balance, no code.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == KECCAK_EMPTY
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let mut buf = bytes;
        Self::decode(&mut buf).map_err(|err| StateError::Decode {
            table: Table::Account,
            reason: err.to_string(),
        })
    }
}

pub fn account_key(address: Address) -> Vec<u8> {
    address.to_vec()
}

/// Storage key: address ++ incarnation (big endian) ++ slot.
pub fn storage_key(address: Address, incarnation: u64, slot: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + 8 + 32);
    key.extend_from_slice(address.as_slice());
    key.extend_from_slice(&incarnation.to_be_bytes());
    key.extend_from_slice(slot.as_slice());
    key
}

/// Code key: address ++ incarnation (big endian).
pub fn code_key(address: Address, incarnation: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + 8);
    key.extend_from_slice(address.as_slice());
    key.extend_from_slice(&incarnation.to_be_bytes());
    key
}

/// Storage values are stored without leading zeroes; zero is the empty value.
pub fn encode_storage_value(value: U256) -> Vec<u8> {
    let bytes = value.to_be_bytes::<32>();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

pub fn decode_storage_value(bytes: &[u8]) -> Result<U256, StateError> {
    U256::try_from_be_slice(bytes).ok_or_else(|| StateError::Decode {
        table: Table::Storage,
        reason: format!("{} byte storage value", bytes.len()),
    })
}
