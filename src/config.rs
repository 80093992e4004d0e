//! Process-level replay settings.

use std::env;
use std::path::PathBuf;
use std::thread;

/// Network id of the main network.
pub const MAINNET_NETWORK_ID: u64 = 1;

/// Default settings of the replay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Number of replay workers. One means execution on the calling thread.
    pub workers: usize,
    /// Where proof-of-work datasets are kept.
    pub dataset_dir: PathBuf,
    pub network_id: u64,
    /// Progress is logged every `log_every` applied tasks.
    pub log_every: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            dataset_dir: default_dataset_dir(),
            network_id: MAINNET_NETWORK_ID,
            log_every: 10_000,
        }
    }
}

/// Platform default location of the proof-of-work datasets.
pub fn default_dataset_dir() -> PathBuf {
    let var = |name: &str| env::var_os(name).filter(|value| !value.is_empty()).map(PathBuf::from);
    dataset_dir_for(env::consts::OS, var)
}

fn dataset_dir_for(os: &str, var: impl Fn(&str) -> Option<PathBuf>) -> PathBuf {
    const DIR: &str = "erigon-ethash";
    let home = var("HOME").unwrap_or_default();
    match os {
        "macos" => home.join("Library").join(DIR),
        "windows" => match var("LOCALAPPDATA") {
            Some(local) => local.join(DIR),
            None => home.join("AppData").join("Local").join(DIR),
        },
        _ => match var("XDG_DATA_HOME") {
            Some(data) => data.join(DIR),
            None => home.join(".local").join("share").join(DIR),
        },
    }
}
