//! Command-line interface for anonbench.
//!
//! Provides commands for running experiments, anonymizing single
//! datasets, managing the data root and recomputing metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
