use super::reader::view;
use super::{
    account_key, code_key, encode_storage_value, storage_key, Account, StateError, StateWrite,
};
use alloy_primitives::{Address, B256, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use versioned_state::{KvLists, RoTx, Table, TxNum, VersionedState};

/// Values overwritten by a task, keyed like the write lists.
///
/// `None` marks a key that did not exist before the task wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorValues {
    pub accounts: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub account_dels: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub storage: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub code: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl PriorValues {
    /// Whether a prior value (or a creation marker) was recorded for `key`.
    pub fn covers(&self, table: Table, key: &[u8]) -> bool {
        match table {
            Table::Account | Table::IncarnationMap => {
                self.accounts.contains_key(key) || self.account_dels.contains_key(key)
            }
            Table::Storage => self.storage.contains_key(key),
            Table::Code => self.code.contains_key(key),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.account_dels.is_empty()
            && self.storage.is_empty()
            && self.code.is_empty()
    }

    fn clear(&mut self) {
        self.accounts.clear();
        self.account_dels.clear();
        self.storage.clear();
        self.code.clear();
    }
}

/// Collects the writes of one task together with the values they replace.
pub struct StateWriter22 {
    rs: Arc<VersionedState>,
    tx: Option<Arc<dyn RoTx>>,
    tx_num: TxNum,
    write_lists: KvLists,
    prevs: PriorValues,
}

impl StateWriter22 {
    pub fn new(rs: Arc<VersionedState>) -> Self {
        Self {
            rs,
            tx: None,
            tx_num: 0,
            write_lists: KvLists::new(),
            prevs: PriorValues::default(),
        }
    }

    pub fn set_tx(&mut self, tx: Option<Arc<dyn RoTx>>) {
        self.tx = tx;
    }

    pub fn set_tx_num(&mut self, tx_num: TxNum) {
        self.tx_num = tx_num;
    }

    pub fn reset_write_set(&mut self) {
        self.write_lists.clear();
        self.prevs.clear();
    }

    pub fn take_write_set(&mut self) -> KvLists {
        std::mem::take(&mut self.write_lists)
    }

    pub fn take_prevs(&mut self) -> PriorValues {
        std::mem::take(&mut self.prevs)
    }

    fn prior(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let value = view(&self.rs, self.tx.as_ref(), self.tx_num, table, key)?;
        Ok((!value.is_empty()).then_some(value))
    }

    fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.write_lists.entry(table).or_default().push(key, value);
    }
}

impl StateWrite for StateWriter22 {
    fn update_account_data(&mut self, address: Address, account: &Account) -> Result<(), StateError> {
        let key = account_key(address);
        if !self.prevs.accounts.contains_key(&key) {
            let prior = self.prior(Table::Account, &key)?;
            self.prevs.accounts.insert(key.clone(), prior);
        }
        self.put(Table::Account, key, account.to_bytes());
        Ok(())
    }

    fn update_account_code(
        &mut self,
        address: Address,
        incarnation: u64,
        code: &[u8],
    ) -> Result<(), StateError> {
        let key = code_key(address, incarnation);
        if !self.prevs.code.contains_key(&key) {
            let prior = self.prior(Table::Code, &key)?;
            self.prevs.code.insert(key.clone(), prior);
        }
        self.put(Table::Code, key, code.to_vec());
        Ok(())
    }

    fn delete_account(&mut self, address: Address) -> Result<(), StateError> {
        let key = account_key(address);
        let prior = self.prior(Table::Account, &key)?;
        let incarnation = match &prior {
            Some(bytes) => Account::from_bytes(bytes)?.incarnation,
            None => 0,
        };
        self.prevs.account_dels.entry(key.clone()).or_insert(prior);
        self.put(Table::Account, key.clone(), Vec::new());
        if incarnation > 0 {
            self.put(Table::IncarnationMap, key, incarnation.to_be_bytes().to_vec());
        }
        Ok(())
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        incarnation: u64,
        slot: &B256,
        value: U256,
    ) -> Result<(), StateError> {
        let key = storage_key(address, incarnation, slot);
        if !self.prevs.storage.contains_key(&key) {
            let prior = self.prior(Table::Storage, &key)?;
            self.prevs.storage.insert(key.clone(), prior);
        }
        self.put(Table::Storage, key, encode_storage_value(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versioned_state::{MemDb, RoDb};

    #[test]
    fn test_first_prior_value_wins() {
        let db = MemDb::new();
        let address = Address::repeat_byte(0x07);
        let before = Account {
            nonce: 1,
            ..Default::default()
        };
        db.put(Table::Account, account_key(address), before.to_bytes());

        let mut writer = StateWriter22::new(Arc::new(VersionedState::new()));
        writer.set_tx(Some(db.begin_ro().unwrap()));

        for nonce in 2..4 {
            let account = Account {
                nonce,
                ..Default::default()
            };
            writer.update_account_data(address, &account).unwrap();
        }
        writer
            .write_account_storage(address, 1, &B256::ZERO, U256::from(5))
            .unwrap();

        let writes = writer.take_write_set();
        let prevs = writer.take_prevs();
        assert_eq!(writes[&Table::Account].len(), 2);
        assert_eq!(
            prevs.accounts[&account_key(address)],
            Some(before.to_bytes())
        );
        // Fresh storage slot.
        assert_eq!(prevs.storage.values().next(), Some(&None));
        for (table, list) in &writes {
            for (key, _) in list.iter() {
                assert!(prevs.covers(*table, key));
            }
        }
    }

    #[test]
    fn test_delete_contract_remembers_incarnation() {
        let db = MemDb::new();
        let address = Address::repeat_byte(0x08);
        let contract = Account {
            incarnation: 3,
            ..Default::default()
        };
        db.put(Table::Account, account_key(address), contract.to_bytes());

        let mut writer = StateWriter22::new(Arc::new(VersionedState::new()));
        writer.set_tx(Some(db.begin_ro().unwrap()));
        writer.delete_account(address).unwrap();

        let writes = writer.take_write_set();
        assert_eq!(writes[&Table::Account].vals[0], Vec::<u8>::new());
        assert_eq!(
            writes[&Table::IncarnationMap].vals[0],
            3u64.to_be_bytes().to_vec()
        );
        assert!(writer.take_prevs().account_dels.contains_key(&account_key(address)));
    }
}
