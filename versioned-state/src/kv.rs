//! Key/value storage with snapshot read-only transactions.
//!
//! [`MemDb`] keeps every table in one ordered map behind a copy-on-write
//! [`Arc`]. Opening a read-only transaction clones the `Arc`, so a
//! transaction keeps observing the exact contents it was opened against while
//! writers continue to modify the database.

use crate::types::Table;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

type Tables = BTreeMap<(Table, Vec<u8>), Vec<u8>>;

/// Errors raised by the key/value layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("transaction already rolled back")]
    TxClosed,
    #[error("database is closed")]
    DbClosed,
    #[error("malformed {table} entry: {reason}")]
    Malformed { table: Table, reason: String },
}

/// A database that can open read-only transactions.
pub trait RoDb: Send + Sync {
    fn begin_ro(&self) -> Result<Arc<dyn RoTx>, KvError>;
}

/// A read-only transaction over a consistent snapshot.
pub trait RoTx: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Returns the last entry of `table` whose key is `<= key`.
    fn last_le(&self, table: Table, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Releases the snapshot. Rolling back twice is a no-op.
    fn rollback(&self);

    fn is_open(&self) -> bool;
}

/// In-memory database.
pub struct MemDb {
    tables: RwLock<Option<Arc<Tables>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Some(Arc::new(Tables::new()))),
        }
    }

    pub fn put(&self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        let mut guard = self.tables.write();
        if let Some(tables) = guard.as_mut() {
            Arc::make_mut(tables).insert((table, key), value);
        }
    }

    pub fn delete(&self, table: Table, key: &[u8]) {
        let mut guard = self.tables.write();
        if let Some(tables) = guard.as_mut() {
            Arc::make_mut(tables).remove(&(table, key.to_vec()));
        }
    }

    /// Number of entries stored in `table`.
    pub fn count(&self, table: Table) -> usize {
        self.tables
            .read()
            .as_ref()
            .map(|tables| tables.keys().filter(|(t, _)| *t == table).count())
            .unwrap_or(0)
    }

    /// Drops the contents. Transactions opened before keep their snapshot.
    pub fn close(&self) {
        *self.tables.write() = None;
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl RoDb for MemDb {
    fn begin_ro(&self) -> Result<Arc<dyn RoTx>, KvError> {
        let snapshot = self.tables.read().clone().ok_or(KvError::DbClosed)?;
        Ok(Arc::new(MemTx {
            snapshot: Mutex::new(Some(snapshot)),
        }))
    }
}

struct MemTx {
    snapshot: Mutex<Option<Arc<Tables>>>,
}

impl MemTx {
    fn tables(&self) -> Result<Arc<Tables>, KvError> {
        self.snapshot.lock().clone().ok_or(KvError::TxClosed)
    }
}

impl RoTx for MemTx {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.tables()?.get(&(table, key.to_vec())).cloned())
    }

    fn last_le(&self, table: Table, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        let tables = self.tables()?;
        let found = tables
            .range((table, Vec::new())..=(table, key.to_vec()))
            .next_back()
            .map(|((_, k), v)| (k.clone(), v.clone()));
        Ok(found)
    }

    fn rollback(&self) {
        self.snapshot.lock().take();
    }

    fn is_open(&self) -> bool {
        self.snapshot.lock().is_some()
    }
}
