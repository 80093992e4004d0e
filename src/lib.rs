//! Incremental world-state replay with a pool of execution workers.
//!
//! # Architecture
//!
//! - **chain**: chain configuration, genesis, blocks and metadata encoding
//! - **state**: account encoding, the read/write tracking state layer and
//!   the per-task account cache
//! - **vm**: the EVM contract the workers rely on, backed by revm
//! - **consensus**: block initialisation and finalisation hooks of the
//!   supported engines
//! - **exec**: tasks, workers, the worker pool and the in-order consumer
//!
//! The versioned overlay, the key/value layer and the scheduler live in the
//! `versioned-state` crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use state_replay::exec::Replay;
//! use state_replay::workload::{Workload, WorkloadConfig};
//!
//! let workload = Workload::generate(WorkloadConfig::default()).unwrap();
//! let replay = Replay::new(workload.genesis.clone(), 4);
//! let outcome = replay.run(&workload.blocks).unwrap();
//!
//! println!("applied {} tasks", outcome.stats.applied);
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod chain;
pub mod config;
pub mod consensus;
pub mod exec;
pub mod state;
pub mod vm;
pub mod workload;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::ReplayConfig;
pub use exec::{Replay, ReplayOutcome, ReplayStats, WorkersPool};
pub use workload::{Workload, WorkloadConfig};
