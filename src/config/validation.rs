//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::Config;
use crate::bridges::BridgeMode;
use anyhow::{bail, Result};

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_tor(config)?;
    validate_ports(config)?;
    validate_bridges(config)?;
    validate_transports(config, config.bridges.mode)?;
    validate_timing(config)?;
    Ok(())
}

/// The proxy `mode` runs must be told to listen on its configured port.
///
/// Neither obfs4proxy nor snowflake-client binds a fixed SOCKS port on its
/// own, so an empty argument list can never serve the daemon's
/// `ClientTransportPlugin` endpoint.
pub fn validate_transports(config: &Config, mode: BridgeMode) -> Result<()> {
    let (name, transport) = match mode {
        BridgeMode::None => return Ok(()),
        BridgeMode::Obfs4 | BridgeMode::Custom => ("obfs4", &config.transports.obfs4),
        BridgeMode::Snowflake => ("snowflake", &config.transports.snowflake),
    };

    if transport.args.is_empty() {
        bail!(
            "transports.{}.args is empty; {:?} bridges need {} listening on 127.0.0.1:{} \
             (pass the listen address with the {{port}} placeholder)",
            name,
            mode,
            transport.binary,
            transport.port
        );
    }
    if !transport.args.iter().any(|a| a.contains("{port}")) {
        tracing::warn!(
            "transports.{}.args does not mention {{port}}; make sure it listens on {}",
            name,
            transport.port
        );
    }
    Ok(())
}

fn validate_tor(config: &Config) -> Result<()> {
    if config.tor.binary.trim().is_empty() {
        bail!("tor.binary cannot be empty");
    }
    if config.tor.control_host.is_empty() {
        bail!("tor.control_host cannot be empty");
    }
    for (name, transport) in [
        ("obfs4", &config.transports.obfs4),
        ("snowflake", &config.transports.snowflake),
    ] {
        if transport.binary.trim().is_empty() {
            bail!("transports.{}.binary cannot be empty", name);
        }
    }
    Ok(())
}

fn validate_ports(config: &Config) -> Result<()> {
    let ports = [
        ("tor.control_port", config.tor.control_port),
        ("tor.socks_port", config.tor.socks_port),
        ("transports.obfs4.port", config.transports.obfs4.port),
        ("transports.snowflake.port", config.transports.snowflake.port),
    ];

    for (i, (name, port)) in ports.iter().enumerate() {
        if *port == 0 {
            bail!("{} cannot be 0", name);
        }
        if let Some((other, _)) = ports[..i].iter().find(|(_, p)| p == port) {
            bail!("{} and {} both use port {}", other, name, port);
        }
    }
    Ok(())
}

fn validate_bridges(config: &Config) -> Result<()> {
    let lists = [
        ("bridges.custom", &config.bridges.custom),
        ("bridges.obfs4", &config.bridges.obfs4),
        ("bridges.snowflake", &config.bridges.snowflake),
    ];
    for (name, list) in lists {
        if let Some(lines) = list {
            if lines.iter().any(|l| l.trim().is_empty()) {
                bail!("{} contains an empty bridge line", name);
            }
        }
    }

    if config.bridges.mode == BridgeMode::Custom && config.bridges.custom.is_none() {
        tracing::warn!("bridges.mode is custom but no custom bridge lines are set");
    }
    Ok(())
}

fn validate_timing(config: &Config) -> Result<()> {
    let retry = &config.retry;

    if retry.connect_attempts == 0 {
        bail!("retry.connect_attempts must be at least 1");
    }
    if retry.connect_retry_ms == 0 {
        bail!("retry.connect_retry_ms cannot be 0");
    }
    // The watchdog must not fire before the first connect attempt
    if retry.watchdog_secs * 1000 <= retry.connect_delay_ms {
        bail!(
            "retry.watchdog_secs ({}) must be longer than retry.connect_delay_ms ({})",
            retry.watchdog_secs,
            retry.connect_delay_ms
        );
    }
    if config.reachability.poll_interval_secs == 0 {
        bail!("reachability.poll_interval_secs cannot be 0");
    }
    Ok(())
}
