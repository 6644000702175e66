//! In-process stand-ins for the daemon, its control port, the transport
//! proxies and the host, used by unit tests.

use crate::error::{Result, TorError};
use crate::reachability::{ConnectivityProbe, Reachability};
use crate::supervisor::daemon::{DaemonConfiguration, DaemonHandle, DaemonLauncher};
use crate::supervisor::TorDelegate;
use crate::tor::control::{BoxedControlStream, ControlConnector};
use crate::transport::TransportService;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, Notify};

/// Shared append-only log for ordering assertions
#[derive(Debug, Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

enum Control {
    Line(String),
    HangUp(oneshot::Sender<()>),
}

#[derive(Default)]
struct DaemonState {
    commands: Mutex<Vec<String>>,
    command_seen: Notify,
    auth_rejected: AtomicBool,
    rejected: Mutex<Vec<String>>,
    info: Mutex<HashMap<String, String>>,
    before_reply: Mutex<Vec<String>>,
    connection: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    backlog: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    held: Mutex<Option<String>>,
    released: Notify,
}

impl DaemonState {
    /// Consume the hold if `command` matches it
    fn should_hold(&self, command: &str) -> bool {
        let mut held = self.held.lock().unwrap();
        if held.as_deref().is_some_and(|p| command.starts_with(p)) {
            *held = None;
            true
        } else {
            false
        }
    }

    fn respond(&self, command: &str) -> String {
        self.commands.lock().unwrap().push(command.to_string());
        self.command_seen.notify_waiters();

        let mut out = String::new();
        for line in self.before_reply.lock().unwrap().drain(..) {
            out.push_str(&line);
            out.push_str("\r\n");
        }

        if command.starts_with("AUTHENTICATE") {
            if self.auth_rejected.load(Ordering::SeqCst) {
                out.push_str("515 Authentication failed: Authentication cookie did not match expected value.\r\n");
            } else {
                out.push_str("250 OK\r\n");
            }
            return out;
        }

        if self
            .rejected
            .lock()
            .unwrap()
            .iter()
            .any(|p| command.starts_with(p.as_str()))
        {
            out.push_str("552 Unrecognized option\r\n");
            return out;
        }

        if let Some(key) = command.strip_prefix("GETINFO ") {
            let info = self.info.lock().unwrap();
            let value = match (info.get(key), key) {
                (Some(v), _) => Some(v.clone()),
                (None, "status/circuit-established") => Some("0".to_string()),
                (None, _) => None,
            };
            match value {
                Some(v) if v.contains('\n') => {
                    out.push_str(&format!("250+{}=\r\n", key));
                    for line in v.lines() {
                        out.push_str(line);
                        out.push_str("\r\n");
                    }
                    out.push_str(".\r\n250 OK\r\n");
                },
                Some(v) => out.push_str(&format!("250-{}={}\r\n250 OK\r\n", key, v)),
                None => out.push_str(&format!("552 Unrecognized key \"{}\"\r\n", key)),
            }
            return out;
        }

        out.push_str("250 OK\r\n");
        out
    }
}

/// Scripted control port peer
#[derive(Clone, Default)]
pub(crate) struct FakeDaemon {
    state: Arc<DaemonState>,
}

impl FakeDaemon {
    /// Every command received so far, across connections
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Wait until a command starting with `prefix` has been received
    pub async fn wait_for_command(&self, prefix: &str) -> String {
        loop {
            let notified = self.state.command_seen.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = self.commands().into_iter().find(|c| c.starts_with(prefix)) {
                return found;
            }
            notified.await;
        }
    }

    /// Delay the reply to the next command starting with `prefix` until
    /// [`release_replies`](Self::release_replies). The connection stops
    /// reading meanwhile, so later replies stay in order behind it.
    pub fn hold_next_reply_to(&self, prefix: &str) {
        *self.state.held.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn release_replies(&self) {
        self.state.released.notify_one();
    }

    pub fn reject_auth(&self) {
        self.state.auth_rejected.store(true, Ordering::SeqCst);
    }

    pub fn reject_commands_starting_with(&self, prefix: &str) {
        self.state.rejected.lock().unwrap().push(prefix.to_string());
    }

    pub fn set_info(&self, key: &str, value: &str) {
        self.state
            .info
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Send a raw line on the live connection, or on the next one
    pub fn emit(&self, line: &str) {
        let connection = self.state.connection.lock().unwrap();
        let delivered = connection
            .as_ref()
            .map(|tx| tx.send(Control::Line(line.to_string())).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.state.backlog.lock().unwrap().push(line.to_string());
        }
    }

    /// Write `line` ahead of the next reply
    pub fn emit_before_next_reply(&self, line: &str) {
        self.state.before_reply.lock().unwrap().push(line.to_string());
    }

    /// Close the live connection and wait until it is gone
    pub async fn hang_up(&self) {
        let connection = self.state.connection.lock().unwrap().take();
        if let Some(tx) = connection {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(Control::HangUp(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    fn serve(&self, stream: DuplexStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for line in self.state.backlog.lock().unwrap().drain(..) {
            let _ = tx.send(Control::Line(line));
        }
        *self.state.connection.lock().unwrap() = Some(tx);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            let mut ack = None;

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let command = line.trim_end();
                            let reply = state.respond(command);
                            if state.should_hold(command) {
                                state.released.notified().await;
                            }
                            if write.write_all(reply.as_bytes()).await.is_err() {
                                break;
                            }
                        },
                        _ => break,
                    },
                    control = rx.recv() => match control {
                        Some(Control::Line(line)) => {
                            if write.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                                break;
                            }
                        },
                        Some(Control::HangUp(done)) => {
                            ack = Some(done);
                            break;
                        },
                        None => break,
                    },
                }
            }

            drop(lines);
            drop(write);
            if let Some(done) = ack {
                let _ = done.send(());
            }
        });
    }
}

/// Connector whose first `refusals` attempts fail with ECONNREFUSED
pub(crate) struct FakeConnector {
    refusals: AtomicUsize,
    daemon: FakeDaemon,
}

impl FakeConnector {
    pub fn pair(refusals: usize) -> (Self, FakeDaemon) {
        let daemon = FakeDaemon::default();
        let connector = Self {
            refusals: AtomicUsize::new(refusals),
            daemon: daemon.clone(),
        };
        (connector, daemon)
    }
}

#[async_trait]
impl ControlConnector for FakeConnector {
    async fn connect(&self) -> std::io::Result<BoxedControlStream> {
        self.daemon.state.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        self.daemon.serve(server);
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "fake-control-port".to_string()
    }
}

/// Transport proxy that only records calls
pub(crate) struct FakeTransport {
    name: String,
    port: u16,
    running: AtomicBool,
    fail_next: AtomicBool,
    log: EventLog,
}

impl FakeTransport {
    pub fn new(name: &str, port: u16) -> Self {
        Self::with_log(name, port, EventLog::default())
    }

    pub fn with_log(name: &str, port: u16, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            port,
            running: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
            log,
        }
    }

    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TransportService for FakeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn start(&self) -> Result<()> {
        self.log.push(format!("{}:start", self.name));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TorError::Transport {
                name: self.name.clone(),
                reason: "binary not found".to_string(),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.log.push(format!("{}:stop", self.name));
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct FakeHandle {
    running: Arc<AtomicBool>,
}

impl DaemonHandle for FakeHandle {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Launcher that records configurations instead of spawning
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    launches: Arc<Mutex<Vec<DaemonConfiguration>>>,
    running: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn launches(&self) -> Vec<DaemonConfiguration> {
        self.launches.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Simulate the daemon exiting on its own
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn fail_launches(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl DaemonLauncher for FakeLauncher {
    fn launch(&self, config: &DaemonConfiguration) -> Result<Box<dyn DaemonHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TorError::Launch("tor: No such file or directory".to_string()));
        }
        self.launches.lock().unwrap().push(config.clone());
        self.running.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            running: Arc::clone(&self.running),
        }))
    }
}

/// Host that records every notification
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    progress: Mutex<Vec<u8>>,
    finished: AtomicUsize,
    difficulties: AtomicUsize,
    changed: Notify,
}

impl RecordingDelegate {
    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn difficulties(&self) -> usize {
        self.difficulties.load(Ordering::SeqCst)
    }

    /// Wait until `check` holds
    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, check: F) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if check(self) {
                return;
            }
            notified.await;
        }
    }
}

impl TorDelegate for RecordingDelegate {
    fn bootstrap_progress(&self, percent: u8) {
        self.progress.lock().unwrap().push(percent);
        self.changed.notify_waiters();
    }

    fn connection_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn connection_difficulties(&self) {
        self.difficulties.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

/// Probe returning whatever the test last set
pub(crate) struct FixedProbe(Mutex<Reachability>);

impl FixedProbe {
    pub fn new(reachability: Reachability) -> Self {
        Self(Mutex::new(reachability))
    }

    pub fn set(&self, reachability: Reachability) {
        *self.0.lock().unwrap() = reachability;
    }
}

impl ConnectivityProbe for FixedProbe {
    fn classify(&self) -> Reachability {
        *self.0.lock().unwrap()
    }
}
