//! torvisor - Tor daemon supervisor
//!
//! Launches a Tor client daemon, keeps its control session alive, relays
//! bootstrap progress, and switches between direct connections and
//! obfs4/snowflake bridges.
//!
//! # Usage
//!
//! ```bash
//! # Run with the configured bridge mode
//! torvisor run
//!
//! # Run through snowflake
//! torvisor run --bridges snowflake
//!
//! # Show what the daemon would be launched with
//! torvisor args --bridges obfs4
//!
//! # List circuits of the running daemon
//! torvisor circuits
//! ```

use anyhow::Result;
use clap::Parser;
use torvisor::cli::{self, Cli, Commands};
use torvisor::{config, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    let config = config::load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Run(args) => {
            cli::run_daemon(config, cli.config.as_deref(), args).await?;
        },
        Commands::Args(args) => {
            cli::run_args(&config, args)?;
        },
        Commands::Bridges(args) => {
            cli::run_bridges(&config, args)?;
        },
        Commands::Circuits(args) => {
            cli::run_circuits(&config, args).await?;
        },
    }

    Ok(())
}
