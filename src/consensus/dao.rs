//! State surgery of the DAO hard fork.

use crate::state::{IntraBlockState, StateError};
use alloy_primitives::{address, Address, U256};

/// Contract receiving the balances of the drained accounts.
pub const DAO_REFUND_CONTRACT: Address = address!("bf4ed7b27f1d666546e30d74d50d173d20bca754");

/// Moves the whole balance of every account in `drain_list` into
/// [`DAO_REFUND_CONTRACT`], creating the contract if needed.
pub fn apply_dao_hard_fork(ibs: &mut IntraBlockState<'_>, drain_list: &[Address]) -> Result<(), StateError> {
    if !ibs.exist(DAO_REFUND_CONTRACT)? {
        ibs.create_account(DAO_REFUND_CONTRACT, false)?;
    }
    for address in drain_list {
        let balance = ibs.get_balance(*address)?;
        ibs.add_balance(DAO_REFUND_CONTRACT, balance)?;
        ibs.set_balance(*address, U256::ZERO)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{account_key, Account, StateReader22};
    use std::sync::Arc;
    use versioned_state::{MemDb, RoDb, Table, VersionedState};

    #[test]
    fn test_drains_into_refund_contract() {
        let drained = [Address::repeat_byte(0x01), Address::repeat_byte(0x02)];
        let db = MemDb::new();
        for (i, address) in drained.iter().enumerate() {
            let account = Account {
                balance: U256::from(100 * (i + 1)),
                ..Default::default()
            };
            db.put(Table::Account, account_key(*address), account.to_bytes());
        }
        let mut reader = StateReader22::new(Arc::new(VersionedState::new()));
        reader.set_tx(Some(db.begin_ro().unwrap()));

        let mut ibs = IntraBlockState::new(&reader);
        apply_dao_hard_fork(&mut ibs, &drained).unwrap();

        assert_eq!(ibs.get_balance(DAO_REFUND_CONTRACT).unwrap(), U256::from(300));
        for address in drained {
            assert_eq!(ibs.get_balance(address).unwrap(), U256::ZERO);
        }
    }
}
