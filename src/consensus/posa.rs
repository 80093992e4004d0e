use super::{ChainHeaderReader, ConsensusError, Engine, EpochStore, PoSA, SystemCall};
use crate::chain::{ChainConfig, SignedTransaction};
use alloy_consensus::Header;
use alloy_primitives::{address, Address, Bytes, TxKind};
use tracing::debug;

pub const VALIDATOR_CONTRACT: Address = address!("0000000000000000000000000000000000001000");
pub const SLASH_CONTRACT: Address = address!("0000000000000000000000000000000000001001");
pub const SYSTEM_REWARD_CONTRACT: Address = address!("0000000000000000000000000000000000001002");

const SYSTEM_CONTRACTS: [Address; 3] = [VALIDATOR_CONTRACT, SLASH_CONTRACT, SYSTEM_REWARD_CONTRACT];

/// `init()`
const INIT_SELECTOR: [u8; 4] = [0xe1, 0xc7, 0x39, 0x2a];
/// `deposit(address)`
const DEPOSIT_SELECTOR: [u8; 4] = [0xf3, 0x40, 0xfa, 0x01];

/// Proof-of-staked-authority engine.
///
/// Validator bookkeeping lives in built-in system contracts. The engine
/// initialises them at block 1 and deposits each block's fees into the
/// validator contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct Posa;

impl Posa {
    pub fn new() -> Self {
        Self
    }

    fn deposit_call(validator: Address) -> Bytes {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&DEPOSIT_SELECTOR);
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(validator.as_slice());
        data.into()
    }
}

impl Engine for Posa {
    fn name(&self) -> &'static str {
        "posa"
    }

    fn initialize(
        &self,
        _config: &ChainConfig,
        _chain: &dyn ChainHeaderReader,
        _epoch: &dyn EpochStore,
        header: &Header,
        _txs: &[SignedTransaction],
        _uncles: &[Header],
        syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError> {
        if header.number != 1 {
            return Ok(());
        }
        for contract in SYSTEM_CONTRACTS {
            debug!(%contract, "initialising system contract");
            syscall.call(contract, Bytes::from_static(&INIT_SELECTOR))?;
        }
        Ok(())
    }

    fn finalize(
        &self,
        _config: &ChainConfig,
        header: &Header,
        _txs: &[SignedTransaction],
        _uncles: &[Header],
        _epoch: &dyn EpochStore,
        _chain: &dyn ChainHeaderReader,
        syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError> {
        syscall.call(VALIDATOR_CONTRACT, Self::deposit_call(header.beneficiary))?;
        Ok(())
    }
}

impl PoSA for Posa {
    fn is_system_transaction(&self, tx: &SignedTransaction, header: &Header) -> Result<bool, ConsensusError> {
        let TxKind::Call(to) = tx.to else {
            return Ok(false);
        };
        if !self.is_system_contract(&to) || tx.gas_price != 0 {
            return Ok(false);
        }
        let sender = tx
            .recover_signer()
            .map_err(|err| ConsensusError::InvalidBlock(err.to_string()))?;
        Ok(sender == header.beneficiary)
    }

    fn is_system_contract(&self, address: &Address) -> bool {
        SYSTEM_CONTRACTS.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxRequest;
    use crate::workload::Account;
    use alloy_primitives::U256;

    fn system_tx(signer: &Account, to: Address, gas_price: u128) -> SignedTransaction {
        TxRequest {
            chain_id: Some(56),
            to: TxKind::Call(to),
            gas_limit: 100_000,
            gas_price,
            value: U256::ZERO,
            ..Default::default()
        }
        .sign(&signer.signing_key)
        .unwrap()
    }

    #[test]
    fn test_system_transaction_classification() {
        let validator = Account::from_seed(1);
        let other = Account::from_seed(2);
        let header = Header {
            number: 5,
            beneficiary: validator.address,
            ..Default::default()
        };
        let posa = Posa::new();

        assert!(posa
            .is_system_transaction(&system_tx(&validator, VALIDATOR_CONTRACT, 0), &header)
            .unwrap());
        // Wrong sender, non-zero gas price, regular target.
        assert!(!posa
            .is_system_transaction(&system_tx(&other, VALIDATOR_CONTRACT, 0), &header)
            .unwrap());
        assert!(!posa
            .is_system_transaction(&system_tx(&validator, SLASH_CONTRACT, 1), &header)
            .unwrap());
        assert!(!posa
            .is_system_transaction(&system_tx(&validator, Address::repeat_byte(0x42), 0), &header)
            .unwrap());
    }

    #[test]
    fn test_deposit_call_encoding() {
        let data = Posa::deposit_call(Address::repeat_byte(0xab));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &DEPOSIT_SELECTOR);
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(&data[16..], Address::repeat_byte(0xab).as_slice());
    }
}
