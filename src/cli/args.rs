//! CLI argument definitions using clap
//!
//! Commands:
//! - aerolive check-config --config <path>
//! - aerolive backoff --config <path>
//! - aerolive simulate --config <path> [--messages N] [--drop-rate R] ...

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AeroLive - reliable real-time delivery over best-effort channels
#[derive(Parser, Debug)]
#[command(name = "aerolive")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a configuration file and print the effective values
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolive.json")]
        config: PathBuf,
    },

    /// Print the reconnect delay schedule
    Backoff {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a lossy in-memory delivery session and report the outcome
    Simulate {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Messages to publish
        #[arg(long, default_value_t = 200)]
        messages: usize,

        /// Probability that one notification path drops a message
        #[arg(long, default_value_t = 0.1)]
        drop_rate: f64,

        /// Probability that a broadcast is sent twice
        #[arg(long, default_value_t = 0.1)]
        duplicate_rate: f64,

        /// Server-side disconnects spread over the run
        #[arg(long, default_value_t = 1)]
        disconnects: usize,

        /// RNG seed for the loss pattern
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
