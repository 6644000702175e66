//! Pluggable transport proxies
//!
//! Two local proxies can serve bridge connections: obfs4 (SOCKS-based
//! circumvention) and snowflake (domain-fronted rendezvous). At most one of
//! them runs at a time.

pub mod process;

pub use process::ProcessTransport;

use crate::bridges::BridgeMode;
use crate::error::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// An opaque local proxy service that can be started and stopped
pub trait TransportService: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Local SOCKS port the proxy binds
    fn port(&self) -> u16;

    /// Start the proxy. Starting a running proxy is a no-op.
    fn start(&self) -> Result<()>;

    /// Stop the proxy. Stopping a stopped proxy is a no-op.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Keeps the two proxies mutually exclusive
pub struct TransportSupervisor {
    obfs4: Arc<dyn TransportService>,
    snowflake: Arc<dyn TransportService>,
    /// Serializes stop-then-start sequences
    switch: Mutex<()>,
}

impl TransportSupervisor {
    pub fn new(obfs4: Arc<dyn TransportService>, snowflake: Arc<dyn TransportService>) -> Self {
        Self {
            obfs4,
            snowflake,
            switch: Mutex::new(()),
        }
    }

    /// Start obfs4, stopping snowflake first
    pub fn start_obfs4(&self) -> Result<()> {
        let _guard = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        Self::switch_to(&self.snowflake, &self.obfs4)
    }

    /// Start snowflake, stopping obfs4 first
    pub fn start_snowflake(&self) -> Result<()> {
        let _guard = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        Self::switch_to(&self.obfs4, &self.snowflake)
    }

    pub fn stop_all(&self) {
        let _guard = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        self.obfs4.stop();
        self.snowflake.stop();
        debug!("All transport proxies stopped");
    }

    /// Bring the proxies in line with a bridge mode
    pub fn apply(&self, mode: BridgeMode) -> Result<()> {
        match mode {
            BridgeMode::None => {
                self.stop_all();
                Ok(())
            },
            BridgeMode::Obfs4 | BridgeMode::Custom => self.start_obfs4(),
            BridgeMode::Snowflake => self.start_snowflake(),
        }
    }

    pub fn obfs4(&self) -> &Arc<dyn TransportService> {
        &self.obfs4
    }

    pub fn snowflake(&self) -> &Arc<dyn TransportService> {
        &self.snowflake
    }

    fn switch_to(from: &Arc<dyn TransportService>, to: &Arc<dyn TransportService>) -> Result<()> {
        from.stop();
        if !to.is_running() {
            info!("Starting {} proxy on 127.0.0.1:{}", to.name(), to.port());
        }
        to.start()
    }
}
