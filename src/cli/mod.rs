//! Command-line interface for torvisor
//!
//! Provides main commands:
//! - `run` - Launch and supervise the Tor daemon
//! - `args` - Print the daemon launch arguments
//! - `bridges` - Print the bridge lines for a mode
//! - `circuits` - List or close circuits of a running daemon

mod inspect;
mod run;

pub use inspect::{run_args, run_bridges, run_circuits};
pub use run::run_daemon;

use crate::bridges::BridgeMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// torvisor - Tor daemon supervisor with pluggable transport bridges
#[derive(Parser, Debug)]
#[command(name = "torvisor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor in the foreground (typically called by systemd)
    Run(RunArgs),

    /// Print the arguments the daemon would be launched with
    Args(BridgeArgs),

    /// Print the bridge lines used for a mode
    Bridges(BridgeArgs),

    /// List circuits of a running daemon
    Circuits(CircuitsArgs),
}

/// Bridge selection overriding the configuration file
#[derive(Parser, Debug, Clone, Default)]
pub struct BridgeArgs {
    /// Bridge mode
    #[arg(long, value_enum)]
    pub bridges: Option<BridgeMode>,

    /// Custom bridge line (repeatable, implies --bridges custom)
    #[arg(long = "bridge")]
    pub custom: Vec<String>,
}

impl BridgeArgs {
    /// Mode and custom list to use, if the command line overrides them
    pub fn selection(&self) -> Option<(BridgeMode, Option<Vec<String>>)> {
        let custom = (!self.custom.is_empty()).then(|| self.custom.clone());
        match (self.bridges, custom) {
            (Some(mode), custom) => Some((mode, custom)),
            (None, Some(custom)) => Some((BridgeMode::Custom, Some(custom))),
            (None, None) => None,
        }
    }
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub bridges: BridgeArgs,

    /// Do not watch for host network changes
    #[arg(long, default_value_t = false)]
    pub no_reachability: bool,
}

/// Arguments for circuits command
#[derive(Parser, Debug)]
pub struct CircuitsArgs {
    /// Close every listed circuit
    #[arg(long, default_value_t = false)]
    pub close: bool,

    /// Request new circuits (SIGNAL RELOAD + NEWNYM) instead of listing
    #[arg(long, default_value_t = false, conflicts_with = "close")]
    pub reconnect: bool,
}
