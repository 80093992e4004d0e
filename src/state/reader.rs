use super::{
    account_key, code_key, decode_storage_value, storage_key, Account, StateError, StateRead,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use revm::primitives::KECCAK_EMPTY;
use std::cell::RefCell;
use std::sync::Arc;
use versioned_state::{KvLists, RoTx, Table, TxNum, VersionedState};

/// Value of `key` as seen by task `tx_num`: the overlay first, then the
/// persistent snapshot. Absent keys read as an empty value.
pub(super) fn view(
    rs: &VersionedState,
    tx: Option<&Arc<dyn RoTx>>,
    tx_num: TxNum,
    table: Table,
    key: &[u8],
) -> Result<Vec<u8>, StateError> {
    if let Some(value) = rs.get(table, key, tx_num) {
        return Ok(value);
    }
    let tx = tx.ok_or(StateError::NoTransaction)?;
    Ok(tx.get(table, key)?.unwrap_or_default())
}

/// Reads world state for one task and records every value it observed.
pub struct StateReader22 {
    rs: Arc<VersionedState>,
    tx: Option<Arc<dyn RoTx>>,
    tx_num: TxNum,
    read_lists: RefCell<KvLists>,
}

impl StateReader22 {
    pub fn new(rs: Arc<VersionedState>) -> Self {
        Self {
            rs,
            tx: None,
            tx_num: 0,
            read_lists: RefCell::new(KvLists::new()),
        }
    }

    /// Rebinds the reader to another state transaction, or to none.
    pub fn set_tx(&mut self, tx: Option<Arc<dyn RoTx>>) {
        self.tx = tx;
    }

    pub fn set_tx_num(&mut self, tx_num: TxNum) {
        self.tx_num = tx_num;
    }

    pub fn reset_read_set(&mut self) {
        self.read_lists.get_mut().clear();
    }

    /// Hands out the reads recorded since the last reset.
    pub fn take_read_set(&mut self) -> KvLists {
        std::mem::take(self.read_lists.get_mut())
    }

    fn read(&self, table: Table, key: Vec<u8>) -> Result<Vec<u8>, StateError> {
        let value = view(&self.rs, self.tx.as_ref(), self.tx_num, table, &key)?;
        self.read_lists
            .borrow_mut()
            .entry(table)
            .or_default()
            .push(key, value.clone());
        Ok(value)
    }
}

impl StateRead for StateReader22 {
    fn read_account_data(&self, address: Address) -> Result<Option<Account>, StateError> {
        let bytes = self.read(Table::Account, account_key(address))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Account::from_bytes(&bytes).map(Some)
    }

    fn read_account_storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: &B256,
    ) -> Result<U256, StateError> {
        let bytes = self.read(Table::Storage, storage_key(address, incarnation, slot))?;
        decode_storage_value(&bytes)
    }

    fn read_account_code(
        &self,
        address: Address,
        incarnation: u64,
        code_hash: B256,
    ) -> Result<Option<Bytes>, StateError> {
        if code_hash == KECCAK_EMPTY {
            return Ok(None);
        }
        let bytes = self.read(Table::Code, code_key(address, incarnation))?;
        Ok((!bytes.is_empty()).then(|| Bytes::from(bytes)))
    }

    fn read_account_incarnation(&self, address: Address) -> Result<u64, StateError> {
        let bytes = self.read(Table::IncarnationMap, account_key(address))?;
        if bytes.is_empty() {
            return Ok(0);
        }
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StateError::Decode {
            table: Table::IncarnationMap,
            reason: format!("{} byte incarnation", bytes.len()),
        })?;
        Ok(u64::from_be_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versioned_state::{KvList, MemDb, RoDb};

    fn setup() -> (MemDb, Arc<VersionedState>, Address) {
        let db = MemDb::new();
        let address = Address::repeat_byte(0x01);
        let account = Account {
            nonce: 1,
            balance: U256::from(50),
            ..Default::default()
        };
        db.put(Table::Account, account_key(address), account.to_bytes());
        (db, Arc::new(VersionedState::new()), address)
    }

    #[test]
    fn test_reads_are_recorded() {
        let (db, rs, address) = setup();
        let mut reader = StateReader22::new(rs);
        reader.set_tx(Some(db.begin_ro().unwrap()));

        let account = reader.read_account_data(address).unwrap().unwrap();
        assert_eq!(account.nonce, 1);
        assert_eq!(reader.read_account_data(Address::ZERO).unwrap(), None);
        let slot = reader
            .read_account_storage(address, 1, &B256::ZERO)
            .unwrap();
        assert_eq!(slot, U256::ZERO);

        let reads = reader.take_read_set();
        assert_eq!(reads[&Table::Account].len(), 2);
        // Absent keys are recorded with an empty value.
        assert_eq!(reads[&Table::Account].vals[1], Vec::<u8>::new());
        assert_eq!(reads[&Table::Storage].len(), 1);
        assert!(reader.take_read_set().is_empty());
    }

    #[test]
    fn test_overlay_shadows_snapshot() {
        let (db, rs, address) = setup();
        let newer = Account {
            nonce: 2,
            ..Default::default()
        };
        let mut writes = KvLists::new();
        writes
            .entry(Table::Account)
            .or_insert_with(KvList::default)
            .push(account_key(address), newer.to_bytes());
        rs.apply(4, &writes);

        let mut reader = StateReader22::new(rs);
        reader.set_tx(Some(db.begin_ro().unwrap()));

        reader.set_tx_num(4);
        assert_eq!(reader.read_account_data(address).unwrap().unwrap().nonce, 1);
        reader.set_tx_num(5);
        assert_eq!(reader.read_account_data(address).unwrap().unwrap().nonce, 2);
    }

    #[test]
    fn test_read_without_transaction_fails() {
        let (_db, rs, address) = setup();
        let reader = StateReader22::new(rs);
        assert_eq!(
            reader.read_account_data(address),
            Err(StateError::NoTransaction)
        );
    }
}
