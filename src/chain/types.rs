//! Blocks, signed transactions and executable messages.

use crate::chain::config::ChainConfig;
use alloy_consensus::Header;
use alloy_primitives::{keccak256, Address, Bytes, Signature, TxKind, B256, U256};
use k256::ecdsa::SigningKey;
use thiserror::Error;

/// Errors raised while resolving the sender of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("chain id mismatch: have {have:?}, want {want}")]
    ChainIdMismatch { have: Option<u64>, want: u64 },
}

/// A block as replayed: header, transactions and uncle headers.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<SignedTransaction>,
    pub uncles: Vec<Header>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<SignedTransaction>, uncles: Vec<Header>) -> Self {
        Self {
            header,
            transactions,
            uncles,
        }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash_slow()
    }

    pub fn coinbase(&self) -> Address {
        self.header.beneficiary
    }
}

/// A signed transaction.
///
/// Dynamic-fee transactions carry `max_priority_fee_per_gas`; for them
/// `gas_price` is the fee cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub chain_id: Option<u64>,
    pub nonce: u64,
    pub gas_price: u128,
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
    pub signature: Signature,
}

/// Unsigned transaction fields, used to build a [`SignedTransaction`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxRequest {
    pub chain_id: Option<u64>,
    pub nonce: u64,
    pub gas_price: u128,
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
}

impl TxRequest {
    /// Computes the hash the sender signs.
    pub fn signing_hash(&self) -> B256 {
        let mut data = Vec::with_capacity(8 + 8 + 16 + 17 + 8 + 21 + 32 + self.input.len());
        data.extend_from_slice(&self.chain_id.unwrap_or_default().to_be_bytes());
        data.extend_from_slice(&self.nonce.to_be_bytes());
        data.extend_from_slice(&self.gas_price.to_be_bytes());
        match self.max_priority_fee_per_gas {
            Some(tip) => {
                data.push(1);
                data.extend_from_slice(&tip.to_be_bytes());
            }
            None => data.push(0),
        }
        data.extend_from_slice(&self.gas_limit.to_be_bytes());
        match self.to {
            TxKind::Call(to) => {
                data.push(1);
                data.extend_from_slice(to.as_slice());
            }
            TxKind::Create => data.push(0),
        }
        data.extend_from_slice(&self.value.to_be_bytes::<32>());
        data.extend_from_slice(&self.input);
        keccak256(&data)
    }

    /// Signs the request with the given key.
    pub fn sign(self, signing_key: &SigningKey) -> Result<SignedTransaction, SignerError> {
        let hash = self.signing_hash();
        let (sig, recovery_id) = signing_key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|err| SignerError::InvalidSignature(err.to_string()))?;
        let signature = Signature::from_signature_and_parity(sig, recovery_id.is_y_odd());

        Ok(SignedTransaction {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_price: self.gas_price,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            gas_limit: self.gas_limit,
            to: self.to,
            value: self.value,
            input: self.input,
            signature,
        })
    }
}

impl SignedTransaction {
    fn request(&self) -> TxRequest {
        TxRequest {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_price: self.gas_price,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            gas_limit: self.gas_limit,
            to: self.to,
            value: self.value,
            input: self.input.clone(),
        }
    }

    pub fn signing_hash(&self) -> B256 {
        self.request().signing_hash()
    }

    /// Transaction hash: signing hash bound to the signature.
    pub fn hash(&self) -> B256 {
        let mut data = Vec::with_capacity(32 + 65);
        data.extend_from_slice(self.signing_hash().as_slice());
        data.extend_from_slice(&self.signature.as_bytes());
        keccak256(&data)
    }

    /// Recovers the sender's address from the signature.
    pub fn recover_signer(&self) -> Result<Address, SignerError> {
        self.signature
            .recover_address_from_prehash(&self.signing_hash())
            .map_err(|err| SignerError::InvalidSignature(err.to_string()))
    }

    /// Resolves the transaction into an executable message.
    ///
    /// The signer rules decide whether replay protection is enforced; the
    /// base fee determines the effective gas price of dynamic-fee
    /// transactions.
    pub fn as_message(&self, signer: &Signer, base_fee: Option<u64>) -> Result<Message, SignerError> {
        if let Some(want) = signer.chain_id {
            if self.chain_id.is_some_and(|have| have != want) {
                return Err(SignerError::ChainIdMismatch {
                    have: self.chain_id,
                    want,
                });
            }
        } else if self.chain_id.is_some() {
            return Err(SignerError::ChainIdMismatch {
                have: self.chain_id,
                want: 0,
            });
        }

        let from = self.recover_signer()?;
        let effective_gas_price = match (self.max_priority_fee_per_gas, base_fee) {
            (Some(tip), Some(base_fee)) => self
                .gas_price
                .min(u128::from(base_fee).saturating_add(tip)),
            _ => self.gas_price,
        };

        Ok(Message {
            from,
            to: self.to,
            nonce: self.nonce,
            value: self.value,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            effective_gas_price,
            chain_id: self.chain_id,
            data: self.input.clone(),
            check_nonce: true,
        })
    }
}

/// Signature rules in effect at one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signer {
    /// Chain id enforced by replay protection, if active.
    pub chain_id: Option<u64>,
}

impl Signer {
    pub fn new(config: &ChainConfig, number: u64) -> Self {
        Self {
            chain_id: config.is_eip155(number).then_some(config.chain_id),
        }
    }
}

/// A transaction resolved against its sender, ready for the EVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender recovered from the signature.
    pub from: Address,
    pub to: TxKind,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    /// Fee cap for dynamic-fee transactions, the gas price otherwise.
    pub gas_price: u128,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Price actually paid per gas under the block's base fee.
    pub effective_gas_price: u128,
    pub chain_id: Option<u64>,
    pub data: Bytes,
    /// Whether the sender nonce must match `nonce`.
    pub check_nonce: bool,
}

impl Message {
    /// Address the message calls, or the contract it creates.
    pub fn target(&self) -> Address {
        match self.to {
            TxKind::Call(to) => to,
            TxKind::Create => self.from.create(self.nonce),
        }
    }
}
