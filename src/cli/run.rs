//! Run command - supervise the daemon until interrupted
//!
//! SIGHUP re-reads the bridge selection from the configuration file and
//! pushes it to the running daemon; Ctrl-C or SIGTERM stops everything.
//! Bridges given on the command line keep precedence over the file.

use super::{BridgeArgs, RunArgs};
use crate::bridges::BridgeMode;
use crate::config::{self, Config};
use crate::reachability::{self, RouteProbe};
use crate::supervisor::{TorDelegate, TorSupervisor};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Reports supervisor notifications through the log
struct LogDelegate;

impl TorDelegate for LogDelegate {
    fn bootstrap_progress(&self, percent: u8) {
        info!("Bootstrap {}%", percent);
    }

    fn connection_finished(&self) {
        info!("Tor is ready");
    }

    fn connection_difficulties(&self) {
        warn!("Tor is having trouble connecting; consider enabling bridges (--bridges obfs4 or snowflake)");
    }
}

type Selection = (BridgeMode, Option<Vec<String>>);

/// Command line selection, else the configuration file's
fn bridge_selection(config: &Config, args: &BridgeArgs) -> Selection {
    args.selection()
        .unwrap_or_else(|| (config.bridges.mode, config.bridges.custom.clone()))
}

/// Bridge selection after re-reading the configuration file.
///
/// Only `[bridges] mode` and `custom` take effect on reload; proxy, port and
/// catalog settings keep their startup values (`running`).
fn reload_selection(running: &Config, path: Option<&Path>, args: &BridgeArgs) -> Result<Selection> {
    let fresh = config::load_config(path).context("Failed to re-read configuration")?;
    let selection = bridge_selection(&fresh, args);
    config::validate_transports(running, selection.0)?;
    Ok(selection)
}

/// Run the supervisor. `config_path` is re-read on SIGHUP.
pub async fn run_daemon(config: Config, config_path: Option<&Path>, args: &RunArgs) -> Result<()> {
    info!("torvisor v{} starting", env!("CARGO_PKG_VERSION"));

    let (mode, custom) = bridge_selection(&config, &args.bridges);
    config::validate_transports(&config, mode)?;

    let supervisor = TorSupervisor::from_config(&config);
    supervisor.set_bridge_configuration(mode, custom);
    info!("Bridge mode: {:?}", supervisor.bridge_mode());

    let delegate: Arc<dyn TorDelegate> = Arc::new(LogDelegate);

    let monitor = if args.no_reachability {
        None
    } else {
        let (tx, rx) = mpsc::channel(4);
        let poller = reachability::spawn_monitor(
            Arc::new(RouteProbe::default()),
            Duration::from_secs(config.reachability.poll_interval_secs),
            tx,
        );
        let subscription = supervisor.subscribe_network_changes(rx);
        Some((poller, subscription))
    };

    supervisor
        .start(Arc::clone(&delegate))
        .await
        .context("Failed to start Tor")?;

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminated");
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading");
                match reload_selection(&config, config_path, &args.bridges) {
                    Ok((mode, custom)) => {
                        info!("Bridge mode: {:?}", mode);
                        supervisor.set_bridge_configuration(mode, custom);
                    },
                    Err(e) => warn!("Keeping current bridges: {:#}", e),
                }
                if let Err(e) = supervisor.reload(Arc::clone(&delegate)).await {
                    warn!("Reload failed: {}", e);
                }
            }
        }
    }

    if let Some((poller, subscription)) = monitor {
        poller.abort();
        subscription.abort();
    }
    supervisor.stop();
    info!("Shutdown complete");
    Ok(())
}
