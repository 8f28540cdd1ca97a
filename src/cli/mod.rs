//! CLI module for AeroLive
//!
//! Provides command-line interface for:
//! - check-config: Validate a configuration file
//! - backoff: Print the reconnect schedule
//! - simulate: Drive a lossy in-memory session end to end

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{
    backoff, check_config, run, run_command, run_simulation, simulate, SimulationOptions,
    SimulationReport,
};
pub use errors::{CliError, CliErrorCode, CliResult};
