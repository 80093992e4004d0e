//! Parallel replay of historical transactions.
//!
//! A chain segment is split into tasks: one per block initialisation, one per
//! transaction and one per block finalisation, numbered with a global
//! sequence number. [`WorkersPool`] workers pull tasks from the shared
//! scheduler and execute them against the versioned state under one shared
//! lock, recording what each task read and wrote. [`Replay`] consumes the
//! executed tasks in sequence order, re-queues those that observed stale
//! state and applies the others.

mod pool;
mod readers;
mod replay;
mod task;
mod worker;

pub use pool::WorkersPool;
pub use readers::{ChainReader, EpochReader};
pub use replay::{Replay, ReplayError, ReplayOutcome, ReplayStats};
pub use task::{Slot, TaskError, TaskKind, TxTask};
pub use worker::{PoolContext, Worker, WorkerError};

#[cfg(test)]
mod tests;
