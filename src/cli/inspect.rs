//! Inspection commands
//!
//! `args` and `bridges` only read configuration. `circuits` talks to an
//! already running daemon over its control port.

use super::{BridgeArgs, CircuitsArgs};
use crate::bridges::{BridgeCatalog, BridgeSettings};
use crate::config::Config;
use crate::supervisor::{SupervisorParts, TorSupervisor};
use crate::tor::{TcpConnector, TorController};
use anyhow::{Context, Result};
use std::sync::Arc;

fn selection(config: &Config, args: &BridgeArgs) -> BridgeSettings {
    match args.selection() {
        Some((mode, custom)) => BridgeSettings::new(mode, custom),
        None => BridgeSettings::new(config.bridges.mode, config.bridges.custom.clone()),
    }
}

/// Print the daemon launch arguments, one per line
pub fn run_args(config: &Config, args: &BridgeArgs) -> Result<()> {
    let mut parts = SupervisorParts::from_config(config);
    parts.bridges = selection(config, args);
    let supervisor = TorSupervisor::new(parts);

    println!("{}", config.tor.binary);
    for arg in supervisor.preview_configuration().args() {
        println!("  {}", arg);
    }
    Ok(())
}

/// Print the bridge lines for the selected mode
pub fn run_bridges(config: &Config, args: &BridgeArgs) -> Result<()> {
    let settings = selection(config, args);
    let lines = BridgeCatalog::from_config(&config.bridges).bridges_for(settings.mode(), settings.custom());

    if lines.is_empty() {
        println!("No bridges for {:?} mode", settings.mode());
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// List, close or rebuild circuits of a running daemon
pub async fn run_circuits(config: &Config, args: &CircuitsArgs) -> Result<()> {
    let controller = TorController::new(Arc::new(TcpConnector::from_config(&config.tor)));
    controller
        .connect()
        .await
        .context("Is the daemon running? Could not reach its control port")?;
    controller
        .authenticate_with_cookie_file(&config.tor.cookie_path())
        .await?;

    if args.reconnect {
        controller.reset_connection().await?;
        println!("Requested new circuits");
        return Ok(());
    }

    let circuits = controller.circuits().await?;
    if circuits.is_empty() {
        println!("No circuits");
    }
    for circuit in &circuits {
        println!(
            "{:>4} {:<9} {}",
            circuit.id,
            circuit.status,
            circuit.purpose.as_deref().unwrap_or("-")
        );
        for node in &circuit.nodes {
            let ip = node
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "       {} {} {}",
                node.fingerprint,
                node.nickname.as_deref().unwrap_or("-"),
                ip
            );
        }
    }

    if args.close && !circuits.is_empty() {
        controller.close_circuits(&circuits).await?;
        println!("Closed {} circuits", circuits.len());
    }

    controller.disconnect();
    Ok(())
}
