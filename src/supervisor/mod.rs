//! Tor process supervisor
//!
//! Top-level orchestrator. Launches the daemon, drives the control session
//! through connect and authentication, relays bootstrap progress to the
//! host, and keeps bridge and reachability settings in sync with the running
//! daemon.
//!
//! Every start or stop bumps a generation counter. Deferred steps, event
//! observers and the watchdog capture the generation they were created for
//! and do nothing once it is stale.

pub mod daemon;
pub mod retry;

pub use daemon::{DaemonConfiguration, DaemonHandle, DaemonLauncher, ProcessLauncher};
pub use retry::RetrySupervisor;

use crate::bridges::{bridges_as_args, bridges_as_conf, BridgeCatalog, BridgeMode, BridgeSettings};
use crate::config::Config;
use crate::error::{Result, TorError};
use crate::reachability::{self, ConnectivityProbe, Reachability, ReachabilityAdapter, RouteProbe};
use crate::tor::{
    Circuit, ControlConnector, EventKind, ObserverAction, ObserverToken, TcpConnector, TorController,
};
use crate::transport::{ProcessTransport, TransportSupervisor};
use crate::util::timer::DelayedTask;
use retry::StallAction;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the supervised daemon as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorState {
    None,
    Started,
    Connected,
    Stopped,
}

/// Host notifications. Called from background tasks.
pub trait TorDelegate: Send + Sync {
    /// Bootstrap percentage, never lower than the previous report
    fn bootstrap_progress(&self, percent: u8);

    /// A circuit is established; sent once per start
    fn connection_finished(&self);

    /// The watchdog fired before a circuit was established
    fn connection_difficulties(&self);
}

/// Timing and paths used by the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub cookie_file: PathBuf,
    pub connect_delay: Duration,
    pub connect_retry: Duration,
    pub connect_attempts: u32,
    pub watchdog: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cookie_file: config.tor.cookie_path(),
            connect_delay: Duration::from_millis(config.retry.connect_delay_ms),
            connect_retry: Duration::from_millis(config.retry.connect_retry_ms),
            connect_attempts: config.retry.connect_attempts,
            watchdog: Duration::from_secs(config.retry.watchdog_secs),
        }
    }
}

/// Collaborators handed to [`TorSupervisor::new`]
pub struct SupervisorParts {
    pub settings: SupervisorSettings,
    /// Base launch arguments, advanced arguments included
    pub base: DaemonConfiguration,
    pub catalog: BridgeCatalog,
    pub bridges: BridgeSettings,
    pub transports: TransportSupervisor,
    pub launcher: Arc<dyn DaemonLauncher>,
    pub connector: Arc<dyn ControlConnector>,
    pub probe: Arc<dyn ConnectivityProbe>,
}

impl SupervisorParts {
    /// Process-backed daemon and proxies, TCP control port, route probe
    pub fn from_config(config: &Config) -> Self {
        let mut base = DaemonConfiguration::base(&config.tor, &config.transports);
        base.extend(config.tor.advanced_args.iter().cloned());

        Self {
            settings: SupervisorSettings::from_config(config),
            base,
            catalog: BridgeCatalog::from_config(&config.bridges),
            bridges: BridgeSettings::new(config.bridges.mode, config.bridges.custom.clone()),
            transports: TransportSupervisor::new(
                Arc::new(ProcessTransport::new("obfs4", &config.transports.obfs4)),
                Arc::new(ProcessTransport::new("snowflake", &config.transports.snowflake)),
            ),
            launcher: Arc::new(ProcessLauncher::new(&config.tor.binary)),
            connector: Arc::new(TcpConnector::from_config(&config.tor)),
            probe: Arc::new(RouteProbe::default()),
        }
    }
}

struct Runtime {
    state: TorState,
    bridges: BridgeSettings,
    daemon: Option<Box<dyn DaemonHandle>>,
    delegate: Option<Weak<dyn TorDelegate>>,
    generation: u64,
    /// Generation that already reported `connection_finished`
    finished: Option<u64>,
    connect_task: Option<DelayedTask>,
    observers: Vec<ObserverToken>,
}

impl Runtime {
    fn transition(&mut self, next: TorState) {
        if self.state != next {
            info!("Tor state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn delegate(&self) -> Option<Arc<dyn TorDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn daemon_running(&self) -> bool {
        self.daemon.as_ref().map(|d| d.is_running()).unwrap_or(false)
    }
}

struct Inner {
    settings: SupervisorSettings,
    base: DaemonConfiguration,
    catalog: BridgeCatalog,
    transports: TransportSupervisor,
    launcher: Arc<dyn DaemonLauncher>,
    controller: TorController,
    reachability: ReachabilityAdapter,
    retry: RetrySupervisor,
    runtime: Mutex<Runtime>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn bridges_configured(&self) -> bool {
        self.lock().bridges.mode().uses_bridges()
    }

    /// Bridge lines for the current mode; brings the proxies in line with it
    fn bridges(&self) -> Vec<String> {
        let (mode, custom) = {
            let rt = self.lock();
            (rt.bridges.mode(), rt.bridges.custom().map(<[String]>::to_vec))
        };
        if let Err(e) = self.transports.apply(mode) {
            warn!("Transport proxy for {:?} bridges failed: {}", mode, e);
        }
        self.catalog.bridges_for(mode, custom.as_deref())
    }

    /// Base + advanced + bridge + IPv6 arguments, in that order
    fn launch_configuration(&self, bridges: &[String]) -> DaemonConfiguration {
        let mut config = self.base.clone();
        config.extend(bridges_as_args(bridges));
        config.extend(reachability::launch_args(
            self.reachability.classify(),
            self.bridges_configured(),
        ));
        config
    }

    async fn start(self: &Arc<Self>, delegate: Arc<dyn TorDelegate>) -> Result<()> {
        let (generation, stale, running, reconfigure) = {
            let mut rt = self.lock();
            rt.generation += 1;
            rt.delegate = Some(Arc::downgrade(&delegate));
            if let Some(task) = rt.connect_task.take() {
                task.cancel();
            }
            if rt.state != TorState::Connected {
                rt.transition(TorState::Started);
            }
            (
                rt.generation,
                std::mem::take(&mut rt.observers),
                rt.daemon_running(),
                rt.bridges.needs_reconfiguration(),
            )
        };
        for token in stale {
            self.controller.remove_observer(token);
        }

        self.arm_watchdog(generation);

        let mut rejected = None;
        let mut deferred = false;
        if running {
            if reconfigure {
                if self.controller.is_authenticated() {
                    if let Err(e) = self.reconfigure_bridges().await {
                        warn!("Live bridge reconfiguration failed: {}", e);
                        rejected = Some(e);
                    }
                } else {
                    debug!("Bridge reconfiguration deferred until authenticated");
                    deferred = true;
                }
            }
        } else {
            // A previous daemon's session is useless to the new one
            self.controller.disconnect();

            let bridges = self.bridges();
            let config = self.launch_configuration(&bridges);
            self.lock().bridges.clear_reconfiguration();

            match self.launcher.launch(&config) {
                Ok(handle) => self.lock().daemon = Some(handle),
                Err(e) => {
                    error!("Could not launch Tor: {}", e);
                    return Err(e);
                },
            }
        }

        let weak = Arc::downgrade(self);
        let task = DelayedTask::schedule(self.settings.connect_delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.establish_session(generation, deferred).await;
            }
        });

        {
            let mut rt = self.lock();
            if rt.generation == generation {
                rt.connect_task = Some(task);
            }
        }

        // The session is still re-established; the rejected bridges stay
        // pending for the next reload
        match rejected {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deferred step: connect, authenticate, apply deferred bridges, subscribe
    async fn establish_session(self: Arc<Self>, generation: u64, reconfigure: bool) {
        let mut attempt = 0;
        loop {
            if !self.is_current(generation) {
                return;
            }
            attempt += 1;
            match self.controller.connect().await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.settings.connect_attempts => {
                    debug!("Control port not ready (attempt {}): {}", attempt, e);
                    tokio::time::sleep(self.settings.connect_retry).await;
                },
                Err(e) => {
                    error!("Giving up on control port after {} attempts: {}", attempt, e);
                    return;
                },
            }
        }

        if !self.is_current(generation) {
            return;
        }
        if !self.controller.is_authenticated() {
            if let Err(e) = self
                .controller
                .authenticate_with_cookie_file(&self.settings.cookie_file)
                .await
            {
                error!("{}", e);
                return;
            }
        }

        if !self.is_current(generation) {
            return;
        }
        if reconfigure && self.lock().bridges.needs_reconfiguration() {
            if let Err(e) = self.reconfigure_bridges().await {
                warn!("Deferred bridge reconfiguration failed: {}", e);
            }
        }

        if let Err(e) = self.controller.set_events(&[EventKind::StatusClient]).await {
            warn!("Could not subscribe to status events: {}", e);
            return;
        }
        self.register_observers(generation);

        match self.controller.circuit_established().await {
            Ok(true) => self.on_circuit_established(generation),
            Ok(false) => debug!("Waiting for Tor to establish a circuit"),
            Err(e) => debug!("Could not query circuit status: {}", e),
        }
    }

    fn register_observers(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let established = self.controller.add_observer(
            EventKind::StatusClient,
            Box::new(move |event| {
                let Some(inner) = weak.upgrade() else {
                    return ObserverAction::Remove;
                };
                if !inner.is_current(generation) {
                    return ObserverAction::Remove;
                }
                match event.circuit_established() {
                    Some(true) => {
                        inner.on_circuit_established(generation);
                        ObserverAction::Remove
                    },
                    _ => ObserverAction::Keep,
                }
            }),
        );

        let weak = Arc::downgrade(self);
        let mut reported: Option<u8> = None;
        let progress = self.controller.add_observer(
            EventKind::StatusClient,
            Box::new(move |event| {
                let Some(inner) = weak.upgrade() else {
                    return ObserverAction::Remove;
                };
                if !inner.is_current(generation) {
                    return ObserverAction::Remove;
                }
                let Some(percent) = event.bootstrap_progress() else {
                    return ObserverAction::Keep;
                };

                if reported.map_or(true, |last| percent > last) {
                    reported = Some(percent);
                    debug!("Bootstrapped {}%", percent);
                    let delegate = inner.lock().delegate();
                    if let Some(delegate) = delegate {
                        delegate.bootstrap_progress(percent);
                    }
                }

                if percent >= 100 {
                    ObserverAction::Remove
                } else {
                    ObserverAction::Keep
                }
            }),
        );

        let mut rt = self.lock();
        if rt.generation == generation {
            rt.observers = vec![established, progress];
        }
    }

    fn on_circuit_established(&self, generation: u64) {
        let delegate = {
            let mut rt = self.lock();
            if rt.generation != generation || rt.finished == Some(generation) {
                return;
            }
            if !matches!(rt.state, TorState::Started | TorState::Connected) {
                return;
            }
            rt.finished = Some(generation);
            rt.transition(TorState::Connected);
            rt.delegate()
        };

        self.retry.cancel();
        info!("Tor circuit established");
        if let Some(delegate) = delegate {
            delegate.connection_finished();
        }
    }

    fn arm_watchdog(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        self.retry.arm(async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_stall(generation).await;
            }
        });
    }

    async fn on_stall(self: &Arc<Self>, generation: u64) {
        let bridges_configured = {
            let rt = self.lock();
            if rt.generation != generation || rt.state == TorState::Connected {
                return;
            }
            rt.bridges.mode().uses_bridges()
        };
        warn!("No circuit after {:?}", self.retry.delay());

        if retry::diagnose(bridges_configured) == StallAction::ToggleNetwork {
            // Detached from the watchdog so a re-arm cannot stop the toggle
            // between DisableNetwork=1 and DisableNetwork=0
            let inner = Arc::clone(self);
            let toggle =
                tokio::spawn(async move { retry::toggle_network(&inner.controller).await });
            match toggle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => debug!("Could not toggle network: {}", e),
                Err(e) => warn!("Network toggle task failed: {}", e),
            }
        }

        let delegate = {
            let rt = self.lock();
            if rt.generation != generation {
                return;
            }
            rt.delegate()
        };
        if let Some(delegate) = delegate {
            delegate.connection_difficulties();
        }
    }

    /// RESETCONF Bridge, then the new bridge lines and UseBridges
    async fn reconfigure_bridges(&self) -> Result<()> {
        let bridges = self.bridges();
        info!("Reconfiguring Tor with {} bridges", bridges.len());
        self.controller.reset_conf(&["Bridge"]).await?;
        self.controller.set_conf(&bridges_as_conf(&bridges)).await?;
        self.lock().bridges.clear_reconfiguration();
        Ok(())
    }

    async fn network_changed(&self) -> Result<Reachability> {
        if !self.controller.is_authenticated() {
            return Err(TorError::NoSession);
        }
        self.reachability
            .apply(&self.controller, self.bridges_configured())
            .await
    }

    fn stop(&self) {
        let (daemon, observers, connect_task) = {
            let mut rt = self.lock();
            rt.generation += 1;
            rt.transition(TorState::Stopped);
            rt.delegate = None;
            (
                rt.daemon.take(),
                std::mem::take(&mut rt.observers),
                rt.connect_task.take(),
            )
        };

        if let Some(task) = connect_task {
            task.cancel();
        }
        self.retry.cancel();
        for token in observers {
            self.controller.remove_observer(token);
        }
        self.controller.disconnect();
        if let Some(daemon) = daemon {
            daemon.cancel();
        }
        self.transports.stop_all();
    }
}

/// Owns the daemon, its control session and the transport proxies
pub struct TorSupervisor {
    inner: Arc<Inner>,
}

impl TorSupervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        let retry = RetrySupervisor::new(parts.settings.watchdog);
        Self {
            inner: Arc::new(Inner {
                settings: parts.settings,
                base: parts.base,
                catalog: parts.catalog,
                transports: parts.transports,
                launcher: parts.launcher,
                controller: TorController::new(parts.connector),
                reachability: ReachabilityAdapter::new(parts.probe),
                retry,
                runtime: Mutex::new(Runtime {
                    state: TorState::None,
                    bridges: parts.bridges,
                    daemon: None,
                    delegate: None,
                    generation: 0,
                    finished: None,
                    connect_task: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(SupervisorParts::from_config(config))
    }

    pub fn state(&self) -> TorState {
        self.inner.lock().state
    }

    pub fn bridge_mode(&self) -> BridgeMode {
        self.inner.lock().bridges.mode()
    }

    pub fn needs_reconfiguration(&self) -> bool {
        self.inner.lock().bridges.needs_reconfiguration()
    }

    /// Whether the bootstrap watchdog is pending
    pub fn watchdog_armed(&self) -> bool {
        self.inner.retry.is_armed()
    }

    pub fn controller(&self) -> &TorController {
        &self.inner.controller
    }

    /// Launch the daemon if needed and (re)establish the control session.
    ///
    /// Returns once the daemon is launched or live-reconfigured; connecting
    /// and bootstrapping continue in the background and are reported through
    /// `delegate`. Only a weak reference to the delegate is kept.
    pub async fn start(&self, delegate: Arc<dyn TorDelegate>) -> Result<()> {
        self.inner.start(delegate).await
    }

    /// Push bridge configuration to the daemon, then [`start`](Self::start)
    pub async fn reload(&self, delegate: Arc<dyn TorDelegate>) -> Result<()> {
        self.inner.lock().bridges.force_reconfiguration();
        self.inner.start(delegate).await
    }

    /// Tear everything down. Never waits for the daemon to exit.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Record a bridge selection; takes effect on the next start or reload
    pub fn set_bridge_configuration(&self, mode: BridgeMode, custom: Option<Vec<String>>) {
        let mut rt = self.inner.lock();
        rt.bridges.set(mode, custom);
        debug!(
            "Bridge configuration {:?}, reconfiguration needed: {}",
            mode,
            rt.bridges.needs_reconfiguration()
        );
    }

    /// Bridge lines for the current mode. Starts the matching proxy.
    pub fn get_bridges(&self) -> Vec<String> {
        self.inner.bridges()
    }

    /// [`get_bridges`](Self::get_bridges) as launch arguments
    pub fn get_bridges_as_args(&self) -> Vec<String> {
        bridges_as_args(&self.inner.bridges())
    }

    /// Launch arguments for the current settings, without touching proxies
    pub fn preview_configuration(&self) -> DaemonConfiguration {
        let bridges = {
            let rt = self.inner.lock();
            self.inner
                .catalog
                .bridges_for(rt.bridges.mode(), rt.bridges.custom())
        };
        self.inner.launch_configuration(&bridges)
    }

    /// SIGNAL RELOAD and NEWNYM
    pub async fn tor_reconnect(&self) -> Result<()> {
        self.inner.controller.reset_connection().await
    }

    pub async fn get_circuits(&self) -> Result<Vec<Circuit>> {
        self.inner.controller.circuits().await
    }

    pub async fn close_circuits(&self, circuits: &[Circuit]) -> Result<()> {
        self.inner.controller.close_circuits(circuits).await
    }

    /// Re-classify the network and push the matching settings
    pub async fn network_changed(&self) -> Result<Reachability> {
        self.inner.network_changed().await
    }

    /// Apply every reachability change received on `changes`
    pub fn subscribe_network_changes(
        &self,
        mut changes: mpsc::Receiver<Reachability>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(reported) = changes.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Host reports {:?} connectivity", reported);
                match inner.network_changed().await {
                    Ok(applied) => debug!("Applied {:?} settings", applied),
                    Err(TorError::NoSession) => {
                        debug!("No control session, settings apply at next launch")
                    },
                    Err(e) => warn!("Could not apply network change: {}", e),
                }
            }
        })
    }
}

impl Drop for TorSupervisor {
    fn drop(&mut self) {
        if matches!(self.state(), TorState::Started | TorState::Connected) {
            self.inner.stop();
        }
    }
}
