//! Versioned state store and task scheduler for incremental state replay.
//!
//! This crate holds the pieces of the replay pipeline that sit *between*
//! execution workers: the raw key/value storage they read from, the
//! multi-version overlay that collects effects of already-applied tasks, and
//! the scheduler that hands tasks to workers.
//!
//! # Core Components
//!
//! - **MemDb**: Snapshot-capable key/value store with read-only transactions
//! - **VersionedState**: Multi-version overlay keyed by global sequence number
//! - **Scheduler**: Blocking task queue ordered by sequence number
//!
//! # Example
//!
//! ```rust
//! use versioned_state::{KvList, KvLists, MemDb, RoDb, Table, VersionedState};
//!
//! let db = MemDb::new();
//! db.put(Table::Account, b"alice".to_vec(), vec![1]);
//!
//! let state = VersionedState::new();
//! let mut writes = KvLists::new();
//! writes.entry(Table::Account).or_insert_with(KvList::default).push(b"alice".to_vec(), vec![2]);
//! state.apply(7, &writes);
//!
//! // Task 8 observes the write of task 7, task 7 itself does not.
//! assert_eq!(state.get(Table::Account, b"alice", 8), Some(vec![2]));
//! assert_eq!(state.get(Table::Account, b"alice", 7), None);
//!
//! let tx = db.begin_ro().unwrap();
//! assert_eq!(tx.get(Table::Account, b"alice").unwrap(), Some(vec![1]));
//! ```

pub mod kv;
pub mod scheduler;
pub mod store;
pub mod types;

pub use kv::{KvError, MemDb, RoDb, RoTx};
pub use scheduler::{Scheduler, SchedulerStats, Task};
pub use store::VersionedState;
pub use types::{KvList, KvLists, Table, TxNum};
