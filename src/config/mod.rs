//! Configuration loading and validation
//!
//! Handles TOML configuration parsing with strict validation.
//! Configuration is immutable after load; bridge changes at runtime go
//! through the supervisor instead.

pub mod file;
mod validation;

pub use file::{load_config, load_from_path, parse_str};
pub use validation::{validate, validate_transports};

use crate::bridges::BridgeMode;
use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tor: TorConfig,
    #[serde(default)]
    pub bridges: BridgesConfig,
    #[serde(default)]
    pub transports: TransportsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

/// Tor daemon launch and control port
#[derive(Debug, Clone, Deserialize)]
pub struct TorConfig {
    /// Path or name of the tor binary
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_control_host")]
    pub control_host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/control_auth_cookie`
    pub cookie_file: Option<PathBuf>,
    /// Defaults to `<data_dir>/onion-auth`
    pub onion_auth_dir: Option<PathBuf>,
    /// Extra daemon arguments appended after the built-in ones
    #[serde(default)]
    pub advanced_args: Vec<String>,
}

impl TorConfig {
    pub fn cookie_path(&self) -> PathBuf {
        self.cookie_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("control_auth_cookie"))
    }

    pub fn onion_auth_path(&self) -> PathBuf {
        self.onion_auth_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("onion-auth"))
    }
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            control_host: default_control_host(),
            control_port: default_control_port(),
            socks_port: default_socks_port(),
            data_dir: default_data_dir(),
            cookie_file: None,
            onion_auth_dir: None,
            advanced_args: Vec::new(),
        }
    }
}

fn default_binary() -> String {
    "tor".to_string()
}
fn default_control_host() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    39060
}
fn default_socks_port() -> u16 {
    39050
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/torvisor/tor")
}

/// Initial bridge selection and catalog overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgesConfig {
    #[serde(default)]
    pub mode: BridgeMode,
    /// Bridge lines used in custom mode
    pub custom: Option<Vec<String>>,
    /// Replaces the built-in obfs4 list
    pub obfs4: Option<Vec<String>>,
    /// Replaces the built-in snowflake list
    pub snowflake: Option<Vec<String>>,
}

/// Pluggable transport proxies
#[derive(Debug, Clone, Deserialize)]
pub struct TransportsConfig {
    #[serde(default = "default_obfs4")]
    pub obfs4: TransportConfig,
    #[serde(default = "default_snowflake")]
    pub snowflake: TransportConfig,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            obfs4: default_obfs4(),
            snowflake: default_snowflake(),
        }
    }
}

/// One proxy binary and the local SOCKS port it listens on
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub binary: String,
    /// Flags that make the proxy listen on `127.0.0.1:{port}`; `{port}` is
    /// replaced with `port`. Required when the bridge mode uses this proxy.
    #[serde(default)]
    pub args: Vec<String>,
    pub port: u16,
}

fn default_obfs4() -> TransportConfig {
    TransportConfig {
        binary: "obfs4proxy".to_string(),
        args: Vec::new(),
        port: 47351,
    }
}
fn default_snowflake() -> TransportConfig {
    TransportConfig {
        binary: "snowflake-client".to_string(),
        args: Vec::new(),
        port: 52610,
    }
}

/// Connect retry and bootstrap watchdog timing
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay between launching the daemon and the first connect attempt
    #[serde(default = "default_connect_delay")]
    pub connect_delay_ms: u64,
    /// Delay between refused connect attempts
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Time allowed to establish a circuit before reporting difficulties
    #[serde(default = "default_watchdog")]
    pub watchdog_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: default_connect_delay(),
            connect_retry_ms: default_connect_retry(),
            connect_attempts: default_connect_attempts(),
            watchdog_secs: default_watchdog(),
        }
    }
}

fn default_connect_delay() -> u64 {
    1000
}
fn default_connect_retry() -> u64 {
    1000
}
fn default_connect_attempts() -> u32 {
    30
}
fn default_watchdog() -> u64 {
    15
}

/// Host connectivity monitoring
#[derive(Debug, Clone, Deserialize)]
pub struct ReachabilityConfig {
    /// How often the route probe runs
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
