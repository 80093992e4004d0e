//! Consumer side of the replay: queues the tasks of a chain segment,
//! validates executed tasks in sequence order and applies their effects.

use super::pool::WorkersPool;
use super::task::{Slot, TxTask};
use super::worker::{PoolContext, WorkerError};
use crate::chain::{rawdb, Block, ChainConfig, Genesis};
use crate::consensus::Consensus;
use crate::state::{account_key, Account, StateError};
use crate::vm::{RevmVm, Vm};
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use versioned_state::{KvError, MemDb, RoDb, RoTx, Scheduler, Table, TxNum, VersionedState};

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("workers stopped after {received} of {expected} tasks")]
    MissingResults { expected: u64, received: u64 },
}

/// Counters of one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Blocks replayed, genesis included.
    pub blocks: u64,
    /// Tasks scheduled.
    pub tasks: u64,
    /// Tasks whose effects were applied.
    pub applied: u64,
    /// Executions discarded because they read stale state.
    pub repeated: u64,
    /// Tasks that failed with an authoritative error.
    pub failed: u64,
    /// System transactions.
    pub skipped: u64,
    /// Keys written to the state database by the final flush.
    pub flushed_keys: usize,
}

/// Result of a replay: statistics and every task in sequence order.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub stats: ReplayStats,
    pub tasks: Vec<Box<TxTask>>,
}

enum Settled {
    Applied(Box<TxTask>),
    Repeat(Box<TxTask>),
}

/// Applies executed tasks to the versioned state.
struct Consumer<'a> {
    rs: &'a VersionedState,
    lock: &'a Mutex<()>,
    db: &'a MemDb,
    db_tx: Option<Arc<dyn RoTx>>,
    stats: ReplayStats,
}

impl Consumer<'_> {
    fn settle(&mut self, task: Box<TxTask>) -> Result<Settled, ReplayError> {
        let lock = self.lock;
        let _guard = lock.lock();

        // Executed with every earlier task applied: the result stands as is.
        let authoritative = task.frontier == task.tx_num;
        if !authoritative && (task.error.is_some() || !self.rs.reads_valid(task.tx_num, &task.read_lists)) {
            warn!(tx_num = task.tx_num, frontier = task.frontier, "re-executing stale task");
            self.stats.repeated += 1;
            return Ok(Settled::Repeat(task));
        }

        match &task.error {
            Some(err) => {
                debug!(tx_num = task.tx_num, block = task.block_num, %err, "task failed");
                self.stats.failed += 1;
            }
            None => {
                self.rs.apply(task.tx_num, &task.write_lists);
                self.apply_balance_increases(&task)?;
                if task.skipped {
                    self.stats.skipped += 1;
                }
            }
        }
        self.stats.applied += 1;
        self.rs.advance_frontier(task.tx_num + 1);
        Ok(Settled::Applied(task))
    }

    /// Credits deferred balance increases on top of the latest version of
    /// each account.
    fn apply_balance_increases(&mut self, task: &TxTask) -> Result<(), ReplayError> {
        for (address, increase) in &task.balance_increase_set {
            let key = account_key(*address);
            let current = match self.rs.get(Table::Account, &key, task.tx_num + 1) {
                Some(bytes) => bytes,
                None => self.db_tx()?.get(Table::Account, &key)?.unwrap_or_default(),
            };
            let mut account = if current.is_empty() {
                Account::default()
            } else {
                Account::from_bytes(&current)?
            };
            account.balance = account.balance.saturating_add(*increase);
            self.rs.put(Table::Account, key, task.tx_num, account.to_bytes());
        }
        Ok(())
    }

    fn db_tx(&mut self) -> Result<&Arc<dyn RoTx>, KvError> {
        if self.db_tx.is_none() {
            self.db_tx = Some(self.db.begin_ro()?);
        }
        self.db_tx.as_ref().ok_or(KvError::TxClosed)
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.db_tx.take() {
            tx.rollback();
        }
    }
}

/// Replays chain segments starting from genesis into a state database.
pub struct Replay {
    config: Arc<ChainConfig>,
    genesis: Arc<Genesis>,
    consensus: Consensus,
    vm: Arc<dyn Vm>,
    db: Arc<MemDb>,
    chain_db: Arc<MemDb>,
    workers: usize,
    log_every: u64,
}

impl Replay {
    pub fn new(genesis: Genesis, workers: usize) -> Self {
        Self {
            config: Arc::new(genesis.config.clone()),
            consensus: Consensus::from_config(&genesis.config),
            genesis: Arc::new(genesis),
            vm: Arc::new(RevmVm::new()),
            db: Arc::new(MemDb::new()),
            chain_db: Arc::new(MemDb::new()),
            workers,
            log_every: 10_000,
        }
    }

    pub fn with_consensus(mut self, consensus: Consensus) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn with_vm(mut self, vm: Arc<dyn Vm>) -> Self {
        self.vm = vm;
        self
    }

    /// Logs progress every `log_every` applied tasks; 0 disables it.
    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every;
        self
    }

    /// State database the replay flushes into.
    pub fn db(&self) -> &Arc<MemDb> {
        &self.db
    }

    /// Database holding headers and epoch proofs.
    pub fn chain_db(&self) -> &Arc<MemDb> {
        &self.chain_db
    }

    /// Replays genesis followed by `blocks`, which must extend it.
    pub fn run(&self, blocks: &[Block]) -> Result<ReplayOutcome, ReplayError> {
        let start = Instant::now();
        let genesis = Arc::new(Block::new(self.genesis.header(), Vec::new(), Vec::new()));
        self.write_chain(&genesis, blocks);
        let tasks = self.build_tasks(genesis, blocks);
        let total = tasks.len() as u64;

        let rs = Arc::new(VersionedState::new());
        let scheduler = Scheduler::<TxTask>::new();
        let lock = Arc::new(Mutex::new(()));
        let ctx = PoolContext {
            lock: lock.clone(),
            db: self.db.clone(),
            chain_db: self.chain_db.clone(),
            rs: rs.clone(),
            scheduler: scheduler.clone(),
            config: self.config.clone(),
            genesis: self.genesis.clone(),
            consensus: self.consensus.clone(),
            vm: self.vm.clone(),
        };
        let mut pool = WorkersPool::new(self.workers, ctx);
        info!(blocks = blocks.len() + 1, tasks = total, workers = pool.len(), "starting replay");

        let mut consumer = Consumer {
            rs: &rs,
            lock: &lock,
            db: &self.db,
            db_tx: None,
            stats: ReplayStats {
                blocks: blocks.len() as u64 + 1,
                tasks: total,
                ..Default::default()
            },
        };
        for task in tasks {
            scheduler.add_work(Box::new(task));
        }

        let mut applied = Vec::new();
        if pool.is_threaded() {
            let mut pending: BTreeMap<TxNum, Box<TxTask>> = BTreeMap::new();
            let mut next: TxNum = 0;
            while next < total {
                if let Some(task) = pending.remove(&next) {
                    match consumer.settle(task)? {
                        Settled::Applied(task) => {
                            next += 1;
                            self.log_progress(next, total, &consumer.stats);
                            applied.push(task);
                        }
                        Settled::Repeat(task) => scheduler.repeat_work(task),
                    }
                    continue;
                }
                match pool.results().recv_timeout(RESULT_POLL_INTERVAL) {
                    Ok(task) => {
                        pending.insert(task.tx_num, task);
                    }
                    Err(RecvTimeoutError::Timeout) if !pool.has_failed() && pool.outstanding() > 0 => {}
                    Err(_) => break,
                }
            }
        } else if let Some(worker) = pool.worker(0) {
            let mut worker = worker.lock();
            while let Some(mut task) = scheduler.try_schedule() {
                worker.run_task(&mut task)?;
                match consumer.settle(task)? {
                    Settled::Applied(task) => {
                        self.log_progress(task.tx_num + 1, total, &consumer.stats);
                        applied.push(task);
                    }
                    Settled::Repeat(task) => scheduler.repeat_work(task),
                }
            }
        }

        pool.wait()?;
        pool.clear();
        let received = applied.len() as u64;
        if received != total {
            return Err(ReplayError::MissingResults {
                expected: total,
                received,
            });
        }

        let mut stats = consumer.stats;
        drop(consumer);
        stats.flushed_keys = rs.flush(&self.db);
        info!(
            tasks = stats.tasks,
            repeated = stats.repeated,
            failed = stats.failed,
            flushed = stats.flushed_keys,
            elapsed = ?start.elapsed(),
            "replay finished"
        );
        Ok(ReplayOutcome {
            stats,
            tasks: applied,
        })
    }

    fn write_chain(&self, genesis: &Block, blocks: &[Block]) {
        let mut td = genesis.header.difficulty;
        rawdb::write_canonical_header(&self.chain_db, &genesis.header, td);
        for block in blocks {
            td = td.saturating_add(block.header.difficulty);
            rawdb::write_canonical_header(&self.chain_db, &block.header, td);
        }
    }

    fn build_tasks(&self, genesis: Arc<Block>, blocks: &[Block]) -> Vec<TxTask> {
        let mut tasks = Vec::new();
        let mut tx_num: TxNum = 0;
        let all = std::iter::once(genesis).chain(blocks.iter().cloned().map(Arc::new));
        for block in all {
            let slots = std::iter::once(Slot::Init)
                .chain((0..block.transactions.len()).map(Slot::Tx))
                .chain(std::iter::once(Slot::Final));
            for slot in slots {
                tasks.push(TxTask::new(tx_num, block.clone(), slot, &self.config));
                tx_num += 1;
            }
        }
        tasks
    }

    fn log_progress(&self, done: u64, total: u64, stats: &ReplayStats) {
        if self.log_every > 0 && done % self.log_every == 0 {
            info!(done, total, repeated = stats.repeated, "replay progress");
        }
    }
}
