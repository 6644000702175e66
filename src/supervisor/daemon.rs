//! Daemon launch
//!
//! Builds the daemon's argument vector and runs it as a child process.

use crate::config::{TorConfig, TransportsConfig};
use crate::error::{Result, TorError};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Ordered launch arguments for one daemon run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonConfiguration {
    args: Vec<String>,
}

impl DaemonConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed flags every run needs: ports, auth cookie, data and auth
    /// directories, and the transport plugin endpoints.
    pub fn base(tor: &TorConfig, transports: &TransportsConfig) -> Self {
        let mut config = Self::new();
        config.push_flag("--ignore-missing-torrc");
        config.push("--ClientOnly", "1");
        config.push("--AvoidDiskWrites", "1");
        config.push("--SocksPort", &tor.socks_port.to_string());
        config.push(
            "--ControlPort",
            &format!("{}:{}", tor.control_host, tor.control_port),
        );
        config.push("--CookieAuthentication", "1");
        config.push("--CookieAuthFile", &tor.cookie_path().to_string_lossy());
        config.push("--DataDirectory", &tor.data_dir.to_string_lossy());
        config.push("--ClientOnionAuthDir", &tor.onion_auth_path().to_string_lossy());
        config.push("--ClientUseIPv6", "1");
        config.push(
            "--ClientTransportPlugin",
            &format!("obfs4 socks5 127.0.0.1:{}", transports.obfs4.port),
        );
        config.push(
            "--ClientTransportPlugin",
            &format!("snowflake socks5 127.0.0.1:{}", transports.snowflake.port),
        );
        config.push("--Log", "notice stdout");
        config
    }

    pub fn push_flag(&mut self, flag: &str) {
        self.args.push(flag.to_string());
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.args.push(key.to_string());
        self.args.push(value.to_string());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, args: I) {
        self.args.extend(args);
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Values of every occurrence of `key`
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.args
            .windows(2)
            .filter(|w| w[0] == key)
            .map(|w| w[1].as_str())
            .collect()
    }
}

/// A launched daemon
pub trait DaemonHandle: Send + Sync {
    fn is_running(&self) -> bool;

    /// Request termination without waiting for it
    fn cancel(&self);
}

/// Starts the daemon for a given configuration
pub trait DaemonLauncher: Send + Sync {
    fn launch(&self, config: &DaemonConfiguration) -> Result<Box<dyn DaemonHandle>>;
}

/// Launches the tor binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: String,
}

impl ProcessLauncher {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl DaemonLauncher for ProcessLauncher {
    fn launch(&self, config: &DaemonConfiguration) -> Result<Box<dyn DaemonHandle>> {
        debug!("Launching {} with {} args", self.binary, config.args().len());
        let child = Command::new(&self.binary)
            .args(config.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TorError::Launch(format!("{}: {}", self.binary, e)))?;

        info!("Tor daemon launched (pid {:?})", child.id());
        Ok(Box::new(TorProcess {
            child: Mutex::new(Some(child)),
        }))
    }
}

struct TorProcess {
    child: Mutex<Option<Child>>,
}

impl DaemonHandle for TorProcess {
    fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(child.as_mut().map(|c| c.try_wait()), Some(Ok(None)))
    }

    fn cancel(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut running) = child.take() {
            match running.start_kill() {
                Ok(()) => info!("Tor daemon cancelled"),
                Err(e) => warn!("Could not signal Tor daemon: {}", e),
            }
        }
    }
}
