//! Account cache used while executing a single task.

use super::{Account, StateError, StateRead, StateWrite};
use crate::chain::Rules;
use alloy_primitives::{keccak256, Address, Bytes, Log, B256, U256};
use revm::primitives::KECCAK_EMPTY;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
struct StateObject {
    /// Account as read before the task, `None` if it did not exist.
    original: Option<Account>,
    data: Account,
    code: Option<Bytes>,
    dirty_code: bool,
    origin_storage: BTreeMap<B256, U256>,
    dirty_storage: BTreeMap<B256, U256>,
    /// Contract created by this task; storage of earlier incarnations is
    /// never read.
    created: bool,
    self_destructed: bool,
}

impl StateObject {
    fn loaded(account: Account) -> Self {
        Self {
            original: Some(account),
            data: account,
            ..Default::default()
        }
    }

    fn origin_value(
        &mut self,
        reader: &dyn StateRead,
        address: Address,
        slot: &B256,
    ) -> Result<U256, StateError> {
        if let Some(value) = self.origin_storage.get(slot) {
            return Ok(*value);
        }
        let value = if self.created {
            U256::ZERO
        } else {
            reader.read_account_storage(address, self.data.incarnation, slot)?
        };
        self.origin_storage.insert(*slot, value);
        Ok(value)
    }
}

/// Credit to an account that was never loaded during the task.
#[derive(Debug, Clone, Copy, Default)]
struct BalanceIncrease {
    increase: U256,
    /// Folded into a loaded account; no longer deferred.
    transferred: bool,
}

/// Caches accounts on top of a [`StateRead`] and turns the changes made by
/// a task into writes.
///
/// Changes are tracked in two steps: addresses modified by the current
/// transaction are journaled and [`soft_finalise`](Self::soft_finalise)
/// promotes them to the task's dirty set, which
/// [`make_write_set`](Self::make_write_set) finally hands to a
/// [`StateWrite`].
///
/// Credits to accounts that were not read are kept aside instead of forcing
/// a read; see [`balance_increase_set`](Self::balance_increase_set).
pub struct IntraBlockState<'r> {
    reader: &'r dyn StateRead,
    objects: BTreeMap<Address, StateObject>,
    nil_accounts: BTreeSet<Address>,
    journal_dirties: BTreeSet<Address>,
    dirties: BTreeSet<Address>,
    balance_inc: BTreeMap<Address, BalanceIncrease>,
    logs: BTreeMap<B256, Vec<Log>>,
    tx_hash: B256,
    block_hash: B256,
    tx_index: usize,
}

impl<'r> IntraBlockState<'r> {
    pub fn new(reader: &'r dyn StateRead) -> Self {
        Self {
            reader,
            objects: BTreeMap::new(),
            nil_accounts: BTreeSet::new(),
            journal_dirties: BTreeSet::new(),
            dirties: BTreeSet::new(),
            balance_inc: BTreeMap::new(),
            logs: BTreeMap::new(),
            tx_hash: B256::ZERO,
            block_hash: B256::ZERO,
            tx_index: 0,
        }
    }

    fn has_pending_increase(&self, address: &Address) -> bool {
        self.balance_inc
            .get(address)
            .is_some_and(|inc| !inc.transferred)
    }

    fn insert_object(&mut self, address: Address, mut object: StateObject) {
        if let Some(inc) = self.balance_inc.get_mut(&address) {
            if !inc.transferred {
                object.data.balance = object.data.balance.saturating_add(inc.increase);
                inc.transferred = true;
            }
        }
        self.objects.insert(address, object);
    }

    fn get_object(&mut self, address: Address) -> Result<Option<&mut StateObject>, StateError> {
        if !self.objects.contains_key(&address) {
            let account = if self.nil_accounts.contains(&address) {
                None
            } else {
                self.reader.read_account_data(address)?
            };
            match account {
                Some(account) => self.insert_object(address, StateObject::loaded(account)),
                None => {
                    self.nil_accounts.insert(address);
                    if !self.has_pending_increase(&address) {
                        return Ok(None);
                    }
                    self.insert_object(address, StateObject::default());
                    self.journal_dirties.insert(address);
                }
            }
        }
        Ok(self.objects.get_mut(&address))
    }

    fn get_or_new_object(&mut self, address: Address) -> Result<&mut StateObject, StateError> {
        if self.get_object(address)?.is_none() {
            self.insert_object(address, StateObject::default());
        }
        self.journal_dirties.insert(address);
        Ok(self.objects.entry(address).or_default())
    }

    pub fn exist(&mut self, address: Address) -> Result<bool, StateError> {
        Ok(self.get_object(address)?.is_some())
    }

    /// Empty in the EIP-161 sense, or non-existent.
    pub fn empty(&mut self, address: Address) -> Result<bool, StateError> {
        Ok(self
            .get_object(address)?
            .map_or(true, |object| object.data.is_empty()))
    }

    pub fn get_balance(&mut self, address: Address) -> Result<U256, StateError> {
        Ok(self
            .get_object(address)?
            .map_or(U256::ZERO, |object| object.data.balance))
    }

    pub fn get_nonce(&mut self, address: Address) -> Result<u64, StateError> {
        Ok(self.get_object(address)?.map_or(0, |object| object.data.nonce))
    }

    pub fn get_code_hash(&mut self, address: Address) -> Result<B256, StateError> {
        Ok(self
            .get_object(address)?
            .map_or(B256::ZERO, |object| object.data.code_hash))
    }

    pub fn get_incarnation(&mut self, address: Address) -> Result<u64, StateError> {
        Ok(self
            .get_object(address)?
            .map_or(0, |object| object.data.incarnation))
    }

    pub fn get_code(&mut self, address: Address) -> Result<Option<Bytes>, StateError> {
        let reader = self.reader;
        let Some(object) = self.get_object(address)? else {
            return Ok(None);
        };
        if object.code.is_none() && object.data.code_hash != KECCAK_EMPTY {
            object.code =
                reader.read_account_code(address, object.data.incarnation, object.data.code_hash)?;
        }
        Ok(object.code.clone())
    }

    pub fn get_state(&mut self, address: Address, slot: &B256) -> Result<U256, StateError> {
        let reader = self.reader;
        let Some(object) = self.get_object(address)? else {
            return Ok(U256::ZERO);
        };
        if let Some(value) = object.dirty_storage.get(slot) {
            return Ok(*value);
        }
        object.origin_value(reader, address, slot)
    }

    /// Credits `amount`. Accounts that were not loaded yet are credited
    /// lazily, without reading them.
    pub fn add_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        if !self.objects.contains_key(&address) {
            let inc = self.balance_inc.entry(address).or_default();
            inc.increase = inc.increase.saturating_add(amount);
            return Ok(());
        }
        let object = self.get_or_new_object(address)?;
        object.data.balance = object.data.balance.saturating_add(amount);
        Ok(())
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        let object = self.get_or_new_object(address)?;
        object.data.balance = object.data.balance.saturating_sub(amount);
        Ok(())
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) -> Result<(), StateError> {
        self.get_or_new_object(address)?.data.balance = balance;
        Ok(())
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), StateError> {
        self.get_or_new_object(address)?.data.nonce = nonce;
        Ok(())
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) -> Result<(), StateError> {
        let object = self.get_or_new_object(address)?;
        object.data.code_hash = if code.is_empty() {
            KECCAK_EMPTY
        } else {
            keccak256(&code)
        };
        object.code = Some(code);
        object.dirty_code = true;
        Ok(())
    }

    pub fn set_state(&mut self, address: Address, slot: B256, value: U256) -> Result<(), StateError> {
        let reader = self.reader;
        let object = self.get_or_new_object(address)?;
        // The original value is recorded so that the write can be compared.
        object.origin_value(reader, address, &slot)?;
        object.dirty_storage.insert(slot, value);
        Ok(())
    }

    /// Marks an account as touched without changing it.
    pub fn touch(&mut self, address: Address) -> Result<(), StateError> {
        self.get_or_new_object(address)?;
        Ok(())
    }

    /// Creates (or resets) an account. Contract creation moves the account
    /// to a fresh incarnation so storage of earlier ones is not observed.
    pub fn create_account(&mut self, address: Address, contract: bool) -> Result<(), StateError> {
        let previous = self.get_object(address)?.cloned();
        let mut prev_incarnation = 0;
        if contract {
            prev_incarnation = match &previous {
                Some(object) if object.self_destructed => object.data.incarnation,
                _ => self.reader.read_account_incarnation(address)?,
            };
            if let Some(object) = &previous {
                prev_incarnation = prev_incarnation.max(object.data.incarnation);
            }
        }

        let mut object = StateObject {
            original: previous.as_ref().and_then(|object| object.original),
            ..Default::default()
        };
        if let Some(previous) = &previous {
            if !previous.self_destructed {
                object.data.balance = previous.data.balance;
            }
        }
        if contract {
            object.created = true;
            object.data.incarnation = prev_incarnation + 1;
        }
        self.objects.insert(address, object);
        self.journal_dirties.insert(address);
        Ok(())
    }

    /// Destroys an account at the end of the task. Returns whether it existed.
    pub fn self_destruct(&mut self, address: Address) -> Result<bool, StateError> {
        let Some(object) = self.get_object(address)? else {
            return Ok(false);
        };
        object.self_destructed = true;
        object.data.balance = U256::ZERO;
        self.journal_dirties.insert(address);
        Ok(true)
    }

    /// Sets the context of the transaction about to execute. Logs added
    /// from now on belong to `tx_hash`.
    pub fn prepare(&mut self, tx_hash: B256, block_hash: B256, tx_index: usize) {
        self.tx_hash = tx_hash;
        self.block_hash = block_hash;
        self.tx_index = tx_index;
    }

    pub fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    pub fn block_hash(&self) -> B256 {
        self.block_hash
    }

    /// Logs of the prepared transaction.
    pub fn current_logs(&self) -> Vec<Log> {
        self.get_logs(self.tx_hash)
    }

    pub fn add_log(&mut self, log: Log) {
        self.logs.entry(self.tx_hash).or_default().push(log);
    }

    pub fn get_logs(&self, tx_hash: B256) -> Vec<Log> {
        self.logs.get(&tx_hash).cloned().unwrap_or_default()
    }

    /// Promotes the changes of the current transaction into the task's
    /// dirty set, without writing anything.
    pub fn soft_finalise(&mut self) {
        let journal = std::mem::take(&mut self.journal_dirties);
        for address in journal {
            if self.objects.contains_key(&address) {
                self.dirties.insert(address);
            }
        }
    }

    /// Credits that are still deferred, by address.
    pub fn balance_increase_set(&self) -> BTreeMap<Address, U256> {
        self.balance_inc
            .iter()
            .filter(|(_, inc)| !inc.transferred)
            .map(|(address, inc)| (*address, inc.increase))
            .collect()
    }

    /// Writes every dirty account through `writer`.
    ///
    /// Under Spurious Dragon rules, dirty accounts left empty are deleted
    /// instead of written.
    pub fn make_write_set(&mut self, rules: &Rules, writer: &mut dyn StateWrite) -> Result<(), StateError> {
        self.soft_finalise();
        for (address, object) in &self.objects {
            let dirty = self.dirties.contains(address);
            let empty_removal = rules.is_spurious_dragon && object.data.is_empty();

            if object.self_destructed || (dirty && empty_removal) {
                if object.original.is_some() {
                    writer.delete_account(*address)?;
                }
                continue;
            }
            if !dirty {
                continue;
            }

            if object.dirty_code {
                if let Some(code) = &object.code {
                    writer.update_account_code(*address, object.data.incarnation, code)?;
                }
            }
            for (slot, value) in &object.dirty_storage {
                if object.origin_storage.get(slot) != Some(value) {
                    writer.write_account_storage(*address, object.data.incarnation, slot, *value)?;
                }
            }
            writer.update_account_data(*address, &object.data)?;
        }
        Ok(())
    }
}
