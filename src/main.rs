//! CLI replaying a generated chain with a pool of workers.

use clap::Parser;
use eyre::WrapErr;
use state_replay::chain::Genesis;
use state_replay::{Replay, ReplayConfig, Workload, WorkloadConfig};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Replays a generated chain into a fresh state database")]
struct Args {
    /// Number of workers; defaults to the available parallelism.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = 1000)]
    accounts: usize,
    #[arg(long, default_value_t = 10)]
    blocks: usize,
    #[arg(long, default_value_t = 100)]
    txs_per_block: usize,
    /// 0.0 = no conflicts, 1.0 = every transfer between the same two accounts.
    #[arg(long, default_value_t = 0.0)]
    conflict_factor: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Log progress every N applied tasks.
    #[arg(long)]
    log_every: Option<u64>,
    /// Genesis JSON whose chain configuration replaces the default one.
    #[arg(long)]
    genesis: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    eyre::ensure!(args.accounts > 0, "at least one account is required");
    let defaults = ReplayConfig::default();
    let workers = args.workers.unwrap_or(defaults.workers);
    info!(
        workers,
        network_id = defaults.network_id,
        dataset_dir = %defaults.dataset_dir.display(),
        "replay settings"
    );

    let chain_config = match &args.genesis {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            Some(Genesis::from_json(&json).wrap_err("parsing genesis")?.config)
        }
        None => None,
    };
    let config = WorkloadConfig {
        num_accounts: args.accounts,
        num_blocks: args.blocks,
        txs_per_block: args.txs_per_block,
        conflict_factor: args.conflict_factor,
        seed: args.seed,
        chain_id: defaults.network_id,
    };
    let workload = match chain_config {
        Some(chain) => Workload::generate_on(config, chain),
        None => Workload::generate(config),
    }
    .wrap_err("generating workload")?;
    info!(
        accounts = args.accounts,
        blocks = args.blocks,
        transactions = workload.num_transactions(),
        "workload generated"
    );

    let replay = Replay::new(workload.genesis.clone(), workers)
        .with_log_every(args.log_every.unwrap_or(defaults.log_every));
    let start = Instant::now();
    let outcome = replay.run(&workload.blocks).wrap_err("replay failed")?;
    let elapsed = start.elapsed();

    let stats = outcome.stats;
    println!(
        "{:>3} workers | {:6} tasks | {:5} repeated | {:4} failed | {:8.2} ms | {:8.0} tx/s",
        workers,
        stats.tasks,
        stats.repeated,
        stats.failed,
        elapsed.as_secs_f64() * 1000.0,
        workload.num_transactions() as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
