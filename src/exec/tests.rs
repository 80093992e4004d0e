use super::*;
use crate::chain::{
    Block, ChainConfig, ConsensusConfig, ContractUpgrade, Genesis, GenesisAccount, PosaConfig, TxRequest,
};
use crate::consensus::dao::DAO_REFUND_CONTRACT;
use crate::consensus::{Consensus, VALIDATOR_CONTRACT};
use crate::state::{account_key, Account};
use crate::vm::RevmVm;
use crate::workload::{self, Workload, WorkloadConfig, INITIAL_BALANCE, TRANSFER_VALUE};
use alloy_consensus::Header;
use alloy_primitives::{keccak256, Address, Bytes, TxKind, U256};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use versioned_state::{MemDb, RoDb, Scheduler, Table, Task, VersionedState};

fn workload(conflict_factor: f64) -> Workload {
    Workload::generate(WorkloadConfig {
        num_accounts: 20,
        num_blocks: 3,
        txs_per_block: 8,
        conflict_factor,
        seed: 7,
        chain_id: 1,
    })
    .unwrap()
}

fn account(db: &MemDb, address: Address) -> Option<Account> {
    let tx = db.begin_ro().unwrap();
    let bytes = tx.get(Table::Account, &account_key(address)).unwrap();
    tx.rollback();
    bytes.map(|bytes| Account::from_bytes(&bytes).unwrap())
}

fn pool_context(genesis: &Genesis) -> PoolContext {
    pool_context_over(genesis, MemDb::new())
}

fn pool_context_over(genesis: &Genesis, db: MemDb) -> PoolContext {
    PoolContext {
        lock: Arc::new(Mutex::new(())),
        db: Arc::new(db),
        chain_db: Arc::new(MemDb::new()),
        rs: Arc::new(VersionedState::new()),
        scheduler: Scheduler::new(),
        config: Arc::new(genesis.config.clone()),
        genesis: Arc::new(genesis.clone()),
        consensus: Consensus::from_config(&genesis.config),
        vm: Arc::new(RevmVm::new()),
    }
}

fn written<'t>(task: &'t TxTask, table: Table, key: &[u8]) -> Option<&'t [u8]> {
    task.write_lists
        .get(&table)?
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, value)| value)
}

fn next_block(parent: &Header, beneficiary: Address, transactions: Vec<crate::chain::SignedTransaction>) -> Block {
    let header = Header {
        parent_hash: parent.hash_slow(),
        number: parent.number + 1,
        beneficiary,
        gas_limit: 30_000_000,
        timestamp: parent.timestamp + 12,
        base_fee_per_gas: parent.base_fee_per_gas,
        ..Default::default()
    };
    Block::new(header, transactions, Vec::new())
}

#[test]
fn test_single_worker_replay() {
    let workload = workload(0.0);
    let replay = Replay::new(workload.genesis.clone(), 1);
    let outcome = replay.run(&workload.blocks).unwrap();

    // Init and final task per block, genesis included, plus the transfers.
    let expected = 2 * (workload.blocks.len() as u64 + 1) + workload.num_transactions() as u64;
    assert_eq!(outcome.stats.tasks, expected);
    assert_eq!(outcome.stats.applied, expected);
    assert_eq!(outcome.stats.failed, 0);
    // One worker always executes on top of every earlier task.
    assert_eq!(outcome.stats.repeated, 0);
    assert!(outcome.stats.flushed_keys > 0);

    for (i, task) in outcome.tasks.iter().enumerate() {
        assert_eq!(task.tx_num, i as u64);
        assert!(task.error.is_none());
        assert_eq!(task.results_size, Some(task.estimate_results_size()));
        for (table, list) in &task.write_lists {
            for (key, _) in list.iter() {
                assert!(task.prevs.covers(*table, key), "uncovered {table} write in task {i}");
            }
        }
    }

    let finals: Vec<_> = outcome
        .tasks
        .iter()
        .filter(|task| task.kind == TaskKind::BlockFinal && task.block_num > 0)
        .collect();
    assert_eq!(finals.len(), workload.blocks.len());
    for task in finals {
        assert!(task.trace_tos.contains(&workload::coinbase(task.block_num)));
    }

    let transfers = outcome
        .tasks
        .iter()
        .filter(|task| matches!(task.kind, TaskKind::Transaction { .. }));
    for task in transfers {
        let txn = task.transaction().unwrap();
        let TxKind::Call(to) = txn.to else {
            panic!("transfer expected");
        };
        assert!(task.trace_tos.contains(&to));
        assert_eq!(task.trace_froms.len(), 1);
    }
}

#[test]
fn test_transfer_balances() {
    let workload = Workload::generate(WorkloadConfig {
        num_accounts: 2,
        num_blocks: 1,
        txs_per_block: 1,
        conflict_factor: 0.0,
        seed: 11,
        chain_id: 1,
    })
    .unwrap();
    let replay = Replay::new(workload.genesis.clone(), 1);
    replay.run(&workload.blocks).unwrap();

    let initial = U256::from(INITIAL_BALANCE);
    let value = U256::from(TRANSFER_VALUE);
    let balances: Vec<U256> = workload
        .accounts
        .iter()
        .map(|acc| account(replay.db(), acc.address).unwrap().balance)
        .collect();
    // Exactly one side paid the value plus fees.
    let (sender, receiver) = if balances[0] < initial {
        (balances[0], balances[1])
    } else {
        (balances[1], balances[0])
    };
    assert_eq!(receiver, initial + value);
    assert!(sender < initial - value);

    let miner = account(replay.db(), workload::coinbase(1)).unwrap();
    let reward = U256::from(2_000_000_000_000_000_000u128);
    assert!(miner.balance > reward);
}

#[test]
fn test_parallel_replay_matches_single_worker() {
    for conflict_factor in [0.0, 0.9] {
        let workload = workload(conflict_factor);
        let single = Replay::new(workload.genesis.clone(), 1);
        let parallel = Replay::new(workload.genesis.clone(), 4);
        let expected = single.run(&workload.blocks).unwrap();
        let outcome = parallel.run(&workload.blocks).unwrap();

        assert_eq!(outcome.stats.applied, expected.stats.applied);
        assert_eq!(outcome.stats.failed, 0);
        let addresses = workload
            .accounts
            .iter()
            .map(|acc| acc.address)
            .chain((1..=workload.blocks.len() as u64).map(workload::coinbase));
        for address in addresses {
            assert_eq!(
                account(parallel.db(), address),
                account(single.db(), address),
                "state of {address} diverged at conflict factor {conflict_factor}"
            );
        }
    }
}

#[test]
fn test_invalid_nonce_is_recorded() {
    let workload = workload(0.0);
    let mut blocks = workload.blocks.clone();
    let bad = TxRequest {
        chain_id: Some(1),
        nonce: 99,
        gas_price: 2_000_000_000,
        gas_limit: 21_000,
        to: TxKind::Call(workload.accounts[1].address),
        value: U256::from(1),
        ..Default::default()
    }
    .sign(&workload.accounts[0].signing_key)
    .unwrap();
    let last = blocks.len() - 1;
    let block = &blocks[last];
    let mut transactions = block.transactions.clone();
    transactions.push(bad);
    blocks[last] = Block::new(block.header.clone(), transactions, Vec::new());

    let replay = Replay::new(workload.genesis.clone(), 1);
    let outcome = replay.run(&blocks).unwrap();
    assert_eq!(outcome.stats.failed, 1);

    let failed: Vec<_> = outcome.tasks.iter().filter(|task| task.error.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].write_lists.is_empty());
    assert!(failed[0].balance_increase_set.is_empty());
    assert!(matches!(failed[0].error, Some(TaskError::Execution(_))));
}

#[test]
fn test_reverted_creation_through_worker_threads() {
    let alice = workload::Account::from_seed(21);
    let bob = workload::Account::from_seed(22);
    let genesis = Genesis {
        config: ChainConfig::all_forks(1),
        gas_limit: 30_000_000,
        alloc: [&alice, &bob]
            .into_iter()
            .map(|acc| (acc.address, GenesisAccount::with_balance(U256::from(INITIAL_BALANCE))))
            .collect(),
        ..Default::default()
    };
    let transfer = |nonce: u64| {
        TxRequest {
            chain_id: Some(1),
            nonce,
            gas_price: 2_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(bob.address),
            value: U256::from(TRANSFER_VALUE),
            ..Default::default()
        }
        .sign(&alice.signing_key)
        .unwrap()
    };
    // Init code: PUSH1 0 PUSH1 0 REVERT
    let create = TxRequest {
        chain_id: Some(1),
        nonce: 0,
        gas_price: 2_000_000_000,
        gas_limit: 100_000,
        to: TxKind::Create,
        input: Bytes::from_static(&[0x60, 0x00, 0x60, 0x00, 0xfd]),
        ..Default::default()
    }
    .sign(&bob.signing_key)
    .unwrap();
    let blocks = vec![next_block(
        &genesis.header(),
        workload::coinbase(1),
        vec![transfer(0), create, transfer(1)],
    )];

    let replay = Replay::new(genesis, 4);
    let outcome = replay.run(&blocks).unwrap();
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.tasks.len(), 7);

    let reverted = outcome
        .tasks
        .iter()
        .find(|task| task.kind == TaskKind::Transaction { index: 1 })
        .unwrap();
    assert!(matches!(
        reverted.error,
        Some(TaskError::Execution(crate::vm::ExecError::Reverted { .. }))
    ));
    assert!(reverted.write_lists.is_empty());
    assert!(reverted.balance_increase_set.is_empty());
    assert_eq!(reverted.results_size, None);

    // Neither side of the failed creation changed.
    assert_eq!(account(replay.db(), bob.address).unwrap().nonce, 0);
    assert_eq!(account(replay.db(), alice.address).unwrap().nonce, 2);
    assert_eq!(
        account(replay.db(), bob.address).unwrap().balance,
        U256::from(INITIAL_BALANCE) + U256::from(TRANSFER_VALUE) * U256::from(2)
    );
}

#[test]
fn test_worker_applies_dao_fork() {
    let drained = Address::repeat_byte(0xd0);
    let config = ChainConfig {
        chain_id: 1,
        homestead_block: Some(0),
        dao_fork_block: Some(1),
        dao_fork_support: true,
        dao_drain_list: vec![drained],
        ..Default::default()
    };
    let genesis = Genesis {
        config: config.clone(),
        gas_limit: 30_000_000,
        ..Default::default()
    };
    let db = MemDb::new();
    let funded = Account {
        balance: U256::from(5_000),
        ..Default::default()
    };
    db.put(Table::Account, account_key(drained), funded.to_bytes());

    let ctx = pool_context_over(&genesis, db);
    let (sender, _results) = bounded(1);
    let mut worker = Worker::new(0, ctx, sender);
    let block = Arc::new(next_block(&genesis.header(), Address::ZERO, Vec::new()));
    let mut task = TxTask::new(1, block, Slot::Init, &config);
    assert_eq!(task.kind, TaskKind::HardFork);

    worker.run_task(&mut task).unwrap();
    assert!(task.error.is_none());

    let drained_after = written(&task, Table::Account, &account_key(drained)).unwrap();
    assert_eq!(Account::from_bytes(drained_after).unwrap().balance, U256::ZERO);

    let refund = written(&task, Table::Account, &account_key(DAO_REFUND_CONTRACT)).unwrap();
    let deferred = task
        .balance_increase_set
        .get(&DAO_REFUND_CONTRACT)
        .copied()
        .unwrap_or_default();
    assert_eq!(Account::from_bytes(refund).unwrap().balance + deferred, U256::from(5_000));
    assert!(task.prevs.covers(Table::Account, &account_key(drained)));
}

#[test]
fn test_worker_upgrades_posa_contracts_before_init() {
    let code = Bytes::from_static(&[0x00]);
    let mut config = ChainConfig::all_forks(56);
    config.consensus = ConsensusConfig::Posa(PosaConfig {
        upgrades: BTreeMap::from([(
            1,
            vec![ContractUpgrade {
                address: VALIDATOR_CONTRACT,
                code: code.clone(),
            }],
        )]),
    });
    let genesis = Genesis {
        config: config.clone(),
        gas_limit: 30_000_000,
        ..Default::default()
    };

    let ctx = pool_context(&genesis);
    assert!(ctx.consensus.is_posa());
    let (sender, _results) = bounded(1);
    let mut worker = Worker::new(0, ctx, sender);
    let block = Arc::new(next_block(&genesis.header(), Address::repeat_byte(0x77), Vec::new()));
    let mut task = TxTask::new(1, block, Slot::Init, &config);
    assert_eq!(task.kind, TaskKind::BlockInit);

    worker.run_task(&mut task).unwrap();
    assert!(task.error.is_none(), "{:?}", task.error);

    let codes = &task.write_lists[&Table::Code];
    assert!(codes.iter().any(|(_, value)| value == &code[..]));
    let validator = written(&task, Table::Account, &account_key(VALIDATOR_CONTRACT)).unwrap();
    assert_eq!(Account::from_bytes(validator).unwrap().code_hash, keccak256(&code));
}

#[test]
fn test_posa_system_transaction_is_skipped() {
    let validator = workload::Account::from_seed(5);
    let mut config = ChainConfig::all_forks(56);
    config.consensus = ConsensusConfig::Posa(PosaConfig::default());
    let genesis = Genesis {
        config,
        gas_limit: 30_000_000,
        alloc: BTreeMap::from([(
            validator.address,
            GenesisAccount::with_balance(U256::from(INITIAL_BALANCE)),
        )]),
        ..Default::default()
    };
    let system_tx = TxRequest {
        chain_id: Some(56),
        nonce: 0,
        gas_price: 0,
        gas_limit: 100_000,
        to: TxKind::Call(VALIDATOR_CONTRACT),
        ..Default::default()
    }
    .sign(&validator.signing_key)
    .unwrap();
    let parent = genesis.header();
    let header = Header {
        parent_hash: parent.hash_slow(),
        number: 1,
        beneficiary: validator.address,
        gas_limit: 30_000_000,
        timestamp: parent.timestamp + 3,
        base_fee_per_gas: parent.base_fee_per_gas,
        ..Default::default()
    };
    let blocks = vec![Block::new(header, vec![system_tx], Vec::new())];

    let replay = Replay::new(genesis, 1);
    let outcome = replay.run(&blocks).unwrap();
    assert_eq!(outcome.stats.skipped, 1);
    assert_eq!(outcome.stats.failed, 0);

    let task = outcome
        .tasks
        .iter()
        .find(|task| matches!(task.kind, TaskKind::Transaction { .. }))
        .unwrap();
    assert!(task.skipped);
    assert!(task.write_lists.is_empty());
    assert!(task.read_lists.is_empty());
    assert_eq!(task.results_size, None);

    // The nonce of the signer is untouched.
    let signer = account(replay.db(), validator.address).unwrap();
    assert_eq!(signer.nonce, 0);
}

#[test]
fn test_worker_reopens_after_reset() {
    let workload = workload(0.0);
    let ctx = pool_context(&workload.genesis);
    let (sender, _results) = bounded(1);
    let mut worker = Worker::new(0, ctx.clone(), sender);
    assert!(worker.is_idle());

    let genesis = Arc::new(Block::new(workload.genesis.header(), Vec::new(), Vec::new()));
    let mut task = TxTask::new(0, genesis.clone(), Slot::Init, &ctx.config);
    worker.run_task(&mut task).unwrap();
    assert!(!worker.is_idle());
    assert!(task.error.is_none());
    assert_eq!(task.write_lists[&Table::Account].len(), workload.accounts.len());

    worker.reset_tx(None, None);
    assert!(worker.is_idle());

    task.reset();
    worker.run_task(&mut task).unwrap();
    assert!(!worker.is_idle());
    assert_eq!(task.write_lists[&Table::Account].len(), workload.accounts.len());

    let shared = ctx.db.begin_ro().unwrap();
    worker.reset_tx(Some(shared.clone()), None);
    // A transaction handed to the worker is not rolled back when adopted again.
    worker.reset_tx(Some(shared.clone()), None);
    assert!(shared.is_open());
    worker.reset_tx(None, None);
    assert!(!shared.is_open());
}

#[test]
fn test_pool_joins_workers() {
    let workload = workload(0.0);
    let ctx = pool_context(&workload.genesis);
    let mut pool = WorkersPool::new(3, ctx.clone());
    assert_eq!(pool.len(), 3);
    assert!(pool.is_threaded());

    let genesis = Arc::new(Block::new(workload.genesis.header(), Vec::new(), Vec::new()));
    ctx.scheduler
        .add_work(Box::new(TxTask::new(0, genesis, Slot::Init, &ctx.config)));
    let task = pool.results().recv().unwrap();
    assert_eq!(task.tx_num, 0);
    assert_eq!(task.kind, TaskKind::Genesis);

    pool.wait().unwrap();
    assert_eq!(pool.outstanding(), 0);
    assert!(!pool.has_failed());
    pool.clear();
    for i in 0..pool.len() {
        assert!(pool.worker(i).unwrap().lock().is_idle());
    }
}

#[test]
fn test_single_worker_pool_spawns_nothing() {
    let workload = workload(0.0);
    let mut pool = WorkersPool::new(1, pool_context(&workload.genesis));
    assert_eq!(pool.len(), 1);
    assert!(!pool.is_threaded());
    assert_eq!(pool.outstanding(), 0);
    pool.wait().unwrap();
}
