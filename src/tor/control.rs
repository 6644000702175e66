//! Tor Control Port client
//!
//! Communicates with the local Tor daemon via the control protocol.
//!
//! One reader task per connection splits the incoming stream into command
//! replies and `650` asynchronous events. Each request queues a reply slot
//! with the reader before its command is written, and the reader fills slots
//! in order. A request abandoned while waiting leaves a closed slot behind,
//! so its reply is discarded instead of reaching the next request. Events
//! are parsed and dispatched to the observer registry. Requests are
//! serialized by holding the writer for the whole write-then-await-reply
//! exchange.

use super::circuit::{parse_circuit_status, parse_router_status_ip, Circuit};
use super::events::{ControlEvent, EventKind};
use super::observers::{EventCallback, ObserverRegistry, ObserverToken};
use crate::config::TorConfig;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Status code of asynchronous event lines
const EVENT_CODE: u16 = 650;

/// How long a request waits for its reply before the session is dropped
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte stream to a control port
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ControlStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedControlStream = Box<dyn ControlStream>;

/// Opens byte streams to the daemon's control port
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self) -> std::io::Result<BoxedControlStream>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// Loopback TCP control port
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }

    pub fn from_config(config: &TorConfig) -> Self {
        Self::new(&config.control_host, config.control_port)
    }
}

#[async_trait]
impl ControlConnector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxedControlStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

/// Connection state of the control client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
}

/// One line of a reply, with its data block if it was a `NNN+` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub text: String,
    pub data: Option<Vec<String>>,
}

/// A complete reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Reply text for error messages
    pub fn message(&self) -> String {
        let text: Vec<&str> = self.lines.iter().map(|l| l.text.as_str()).collect();
        format!("{} {}", self.code, text.join("; "))
    }

    /// Value of `key` in a GETINFO reply
    pub fn value(&self, key: &str) -> Option<String> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.text.split_once('=')?;
            if k != key {
                return None;
            }
            match &line.data {
                Some(data) => Some(data.join("\n")),
                None => Some(v.to_string()),
            }
        })
    }
}

/// Slot the reader task fills with the next complete reply
type ReplySlot = oneshot::Sender<Reply>;

struct Channel {
    writer: WriteHalf<BoxedControlStream>,
    slots: mpsc::UnboundedSender<ReplySlot>,
}

struct Session {
    id: u64,
    channel: tokio::sync::Mutex<Channel>,
    reader: JoinHandle<()>,
}

/// State shared with the reader task
struct Shared {
    state: Mutex<ControlState>,
    /// Id of the live session; readers of older sessions must not touch state
    current: AtomicU64,
    observers: ObserverRegistry,
}

impl Shared {
    fn set_state(&self, state: ControlState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> ControlState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connection to Tor control port
pub struct TorController {
    connector: Arc<dyn ControlConnector>,
    shared: Arc<Shared>,
    session: Mutex<Option<Arc<Session>>>,
    next_session: AtomicU64,
}

impl TorController {
    pub fn new(connector: Arc<dyn ControlConnector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(ControlState::Disconnected),
                current: AtomicU64::new(0),
                observers: ObserverRegistry::new(),
            }),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ControlState {
        self.shared.state()
    }

    /// True once a channel is open, authenticated or not
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ControlState::Authenticating | ControlState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ControlState::Authenticated
    }

    /// Open the control channel.
    ///
    /// Fails with [`TorError::Connect`] when the port refuses the connection,
    /// which usually means the daemon is not listening yet.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = self.connector.endpoint();
        debug!("Connecting to Tor control port: {}", endpoint);
        self.shared.set_state(ControlState::Connecting);

        let stream = match self.connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.set_state(ControlState::Disconnected);
                return Err(TorError::Connect(e));
            },
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();

        self.shared.current.store(id, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            slot_rx,
            Arc::clone(&self.shared),
            id,
        ));

        let session = Arc::new(Session {
            id,
            channel: tokio::sync::Mutex::new(Channel {
                writer: write_half,
                slots: slot_tx,
            }),
            reader,
        });

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.shared.set_state(ControlState::Authenticating);
        info!("Connected to Tor control port at {}", endpoint);
        Ok(())
    }

    /// Authenticate with raw cookie bytes
    pub async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        match self.state() {
            ControlState::Authenticated => return Ok(()),
            ControlState::Authenticating => {},
            _ => return Err(TorError::NoSession),
        }

        let cookie_hex = data_encoding::HEXLOWER.encode(cookie);
        let reply = self
            .exchange(&format!("AUTHENTICATE {}", cookie_hex))
            .await?;

        if !reply.is_ok() {
            return Err(TorError::Auth(reply.message()));
        }

        self.shared.set_state(ControlState::Authenticated);
        info!("Authenticated to Tor control port");
        Ok(())
    }

    /// Read the cookie file and authenticate with it
    pub async fn authenticate_with_cookie_file(&self, path: &Path) -> Result<()> {
        let cookie = tokio::fs::read(path)
            .await
            .map_err(|e| TorError::Auth(format!("cannot read cookie {:?}: {}", path, e)))?;
        debug!("Read {} byte auth cookie from {:?}", cookie.len(), path);
        self.authenticate(&cookie).await
    }

    /// Drop the session. Idempotent.
    pub fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(session) = session {
            self.drop_session(&session);
            info!("Disconnected from Tor control port");
        }
    }

    /// Drop `session` if it is still the live one
    fn discard_session(&self, session: &Session) {
        let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|s| s.id) == Some(session.id) {
            current.take();
        }
        drop(current);
        self.drop_session(session);
    }

    fn drop_session(&self, session: &Session) {
        // Only the live session may reset shared state
        if self
            .shared
            .current
            .compare_exchange(session.id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.set_state(ControlState::Disconnected);
            self.shared.observers.clear();
        }
        session.reader.abort();
    }

    /// Send a command on an authenticated session
    pub async fn send_command(&self, cmd: &str) -> Result<Reply> {
        if !self.is_authenticated() {
            return Err(TorError::NoSession);
        }
        self.exchange(cmd).await
    }

    /// Write one command and wait for its reply
    async fn exchange(&self, cmd: &str) -> Result<Reply> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TorError::NoSession)?;

        let preview = if cmd.starts_with("AUTHENTICATE") {
            "AUTHENTICATE ****"
        } else {
            cmd.get(..100).unwrap_or(cmd)
        };
        debug!("Sending Tor command: {}", preview);

        let mut channel = session.channel.lock().await;

        // The slot is queued before any byte is written so the reply cannot
        // overtake it
        let (slot, reply) = oneshot::channel();
        channel
            .slots
            .send(slot)
            .map_err(|_| TorError::Disconnected)?;

        let write = PartialWrite {
            controller: self,
            session: &session,
            armed: true,
        };
        channel
            .writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|_| TorError::Disconnected)?;
        channel
            .writer
            .flush()
            .await
            .map_err(|_| TorError::Disconnected)?;
        write.disarm();

        match tokio::time::timeout(REPLY_TIMEOUT, reply).await {
            Ok(Ok(reply)) => {
                trace!("Reply: {}", reply.message());
                Ok(reply)
            },
            Ok(Err(_)) => Err(TorError::Disconnected),
            Err(_) => {
                warn!("Timeout waiting for Tor response to {}", preview);
                drop(channel);
                self.discard_session(&session);
                Err(TorError::Disconnected)
            },
        }
    }

    /// Send a command and require a 2xx reply
    async fn command_ok(&self, cmd: &str) -> Result<Reply> {
        let reply = self.send_command(cmd).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(TorError::Command(reply.message()))
        }
    }

    /// SETCONF with the given key/value pairs, in order
    pub async fn set_conf(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let pairs: Vec<String> = entries.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let reply = self.send_command(&format!("SETCONF {}", pairs.join(" "))).await?;
        if !reply.is_ok() {
            warn!("Tor rejected SETCONF: {}", reply.message());
            return Err(TorError::ConfigRejected(reply.message()));
        }
        Ok(())
    }

    /// RESETCONF the given keys back to their defaults
    pub async fn reset_conf(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let reply = self
            .send_command(&format!("RESETCONF {}", keys.join(" ")))
            .await?;
        if !reply.is_ok() {
            return Err(TorError::ConfigRejected(reply.message()));
        }
        Ok(())
    }

    /// Enable delivery of the given asynchronous events
    pub async fn set_events(&self, kinds: &[EventKind]) -> Result<()> {
        let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        self.command_ok(&format!("SETEVENTS {}", names.join(" ")))
            .await?;
        Ok(())
    }

    /// GETINFO a single key
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self.command_ok(&format!("GETINFO {}", key)).await?;
        reply
            .value(key)
            .ok_or_else(|| TorError::Command(format!("GETINFO reply missing {}", key)))
    }

    pub async fn signal(&self, signal: &str) -> Result<()> {
        self.command_ok(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }

    /// Tear down and rebuild circuits so new settings take effect
    pub async fn reset_connection(&self) -> Result<()> {
        self.signal("RELOAD").await?;
        self.signal("NEWNYM").await
    }

    /// Whether the daemon currently has a usable circuit
    pub async fn circuit_established(&self) -> Result<bool> {
        Ok(self.get_info("status/circuit-established").await?.trim() == "1")
    }

    /// Current circuits, with relay addresses resolved where possible
    pub async fn circuits(&self) -> Result<Vec<Circuit>> {
        let status = self.get_info("circuit-status").await?;
        let mut circuits = parse_circuit_status(&status);

        let mut addresses = HashMap::new();
        for circuit in &mut circuits {
            for node in &mut circuit.nodes {
                if !addresses.contains_key(&node.fingerprint) {
                    let ip = match self.get_info(&format!("ns/id/{}", node.fingerprint)).await {
                        Ok(entry) => parse_router_status_ip(&entry),
                        Err(TorError::Command(msg)) => {
                            debug!("No router status for {}: {}", node.fingerprint, msg);
                            None
                        },
                        Err(e) => return Err(e),
                    };
                    addresses.insert(node.fingerprint.clone(), ip);
                }
                node.ip = addresses.get(&node.fingerprint).copied().flatten();
            }
        }

        debug!("Fetched {} circuits", circuits.len());
        Ok(circuits)
    }

    pub async fn close_circuit(&self, id: &str) -> Result<()> {
        self.command_ok(&format!("CLOSECIRCUIT {}", id)).await?;
        Ok(())
    }

    /// Close each circuit; fails if any close was refused
    pub async fn close_circuits(&self, circuits: &[Circuit]) -> Result<()> {
        let mut failed = Vec::new();
        for circuit in circuits {
            if let Err(e) = self.close_circuit(&circuit.id).await {
                match e {
                    TorError::Command(_) => failed.push(circuit.id.clone()),
                    other => return Err(other),
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(TorError::Command(format!(
                "could not close circuits {}",
                failed.join(",")
            )))
        }
    }

    pub fn add_observer(&self, kind: EventKind, callback: EventCallback) -> ObserverToken {
        self.shared.observers.add(kind, callback)
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        self.shared.observers.remove(token)
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.len()
    }
}

/// Tears the session down unless the command was written completely.
///
/// A command cut off mid-write leaves the daemon parsing a half line, and a
/// failed write means the channel is gone.
struct PartialWrite<'a> {
    controller: &'a TorController,
    session: &'a Session,
    armed: bool,
}

impl PartialWrite<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialWrite<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Control command interrupted while writing, dropping session");
            self.controller.discard_session(self.session);
        }
    }
}

impl Drop for TorController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Split `NNN<sep>text` into its parts
fn split_status_line(line: &str) -> Option<(u16, char, &str)> {
    if line.len() < 4 || !line.is_char_boundary(4) {
        return None;
    }
    let code = line[..3].parse::<u16>().ok()?;
    let sep = line[3..4].chars().next()?;
    if !matches!(sep, ' ' | '-' | '+') {
        return None;
    }
    Some((code, sep, &line[4..]))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

/// Read a data block up to the terminating `.` line
async fn read_data_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<String>> {
    let mut data = Vec::new();
    while let Some(line) = read_line(reader).await? {
        if line == "." {
            return Ok(data);
        }
        match line.strip_prefix('.') {
            Some(unescaped) if unescaped.starts_with('.') => data.push(unescaped.to_string()),
            _ => data.push(line),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "control port closed inside data block",
    ))
}

async fn read_loop<R: AsyncBufRead + Unpin>(
    mut reader: R,
    mut slots: mpsc::UnboundedReceiver<ReplySlot>,
    shared: Arc<Shared>,
    session_id: u64,
) {
    let mut pending: Option<Reply> = None;
    let mut event_head: Option<String> = None;

    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Tor control port closed the connection");
                break;
            },
            Err(e) => {
                warn!("Error reading from Tor control port: {}", e);
                break;
            },
        };

        let Some((code, sep, text)) = split_status_line(&line) else {
            warn!("Ignoring malformed control line: {:?}", line);
            continue;
        };
        let text = text.to_string();

        let data = if sep == '+' {
            match read_data_block(&mut reader).await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Error reading data block: {}", e);
                    break;
                },
            }
        } else {
            None
        };

        if code == EVENT_CODE {
            // Multi-line events are identified by their first line
            let head = event_head.get_or_insert(text);
            if sep == ' ' {
                let body = std::mem::take(head);
                event_head = None;
                match ControlEvent::parse(&body) {
                    Ok(event) => {
                        let invoked = shared.observers.dispatch(&event);
                        trace!("Dispatched {} event to {} observers", event.kind, invoked);
                    },
                    Err(e) => warn!("Dropping event: {}", e),
                }
            }
            continue;
        }

        let reply = pending.get_or_insert_with(|| Reply {
            code,
            lines: Vec::new(),
        });
        reply.lines.push(ReplyLine { text, data });
        if sep == ' ' {
            reply.code = code;
            if let Some(done) = pending.take() {
                match slots.try_recv() {
                    Ok(slot) => {
                        if let Err(orphan) = slot.send(done) {
                            debug!("Discarding reply to abandoned request: {}", orphan.message());
                        }
                    },
                    Err(_) => warn!("Discarding unsolicited reply: {}", done.message()),
                }
            }
        }
    }

    if shared.current.load(Ordering::SeqCst) == session_id {
        shared.set_state(ControlState::Disconnected);
        shared.observers.clear();
    }
}
