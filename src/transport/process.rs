//! Transport proxy backed by a child process

use super::TransportService;
use crate::config::TransportConfig;
use crate::error::{Result, TorError};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Placeholder in configured arguments replaced by the proxy's port
const PORT_PLACEHOLDER: &str = "{port}";

/// Runs a proxy binary as a child process
pub struct ProcessTransport {
    name: String,
    binary: String,
    args: Vec<String>,
    port: u16,
    child: Mutex<Option<Child>>,
}

impl ProcessTransport {
    pub fn new(name: &str, config: &TransportConfig) -> Self {
        Self {
            name: name.to_string(),
            binary: config.binary.clone(),
            args: config.args.clone(),
            port: config.port,
            child: Mutex::new(None),
        }
    }

    fn command_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

impl TransportService for ProcessTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn start(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = child.as_mut() {
            match running.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => debug!("{} proxy had exited with {}", self.name, status),
                Err(e) => warn!("Could not poll {} proxy: {}", self.name, e),
            }
        }

        let spawned = Command::new(&self.binary)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TorError::Transport {
                name: self.name.clone(),
                reason: format!("{}: {}", self.binary, e),
            })?;

        info!(
            "{} proxy started (pid {:?}) on 127.0.0.1:{}",
            self.name,
            spawned.id(),
            self.port
        );
        *child = Some(spawned);
        Ok(())
    }

    fn stop(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut running) = child.take() {
            if let Err(e) = running.start_kill() {
                debug!("{} proxy already gone: {}", self.name, e);
            } else {
                info!("{} proxy stopped", self.name);
            }
        }
    }

    fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(child.as_mut().map(|c| c.try_wait()), Some(Ok(None)))
    }
}
