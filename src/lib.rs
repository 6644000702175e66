//! torvisor library crate
//!
//! Supervises a Tor client daemon: launch, control-port session, bootstrap
//! reporting, bridge and pluggable transport selection, and recovery when
//! bootstrap stalls.
//!
//! # Modules
//!
//! - [`supervisor`] - Top-level orchestrator, daemon launch, bootstrap watchdog
//! - [`tor`] - Control port client, async events, circuits
//! - [`bridges`] - Bridge catalog and reconfiguration tracking
//! - [`transport`] - obfs4 / snowflake proxy processes
//! - [`reachability`] - IPv6-only detection and daemon settings
//! - [`config`] - Configuration loading and validation
//! - [`cli`] - Command-line interface (run, args, bridges, circuits)
//! - [`util`] - Timers

// Allow common stylistic patterns during development.
// These can be tightened as the codebase matures.
#![allow(clippy::missing_const_for_fn)] // Const fn optimization is low priority
#![allow(clippy::doc_markdown)] // Doc formatting is secondary
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::option_if_let_else)] // Style preference
#![allow(clippy::use_self)] // Explicit types are clearer
#![allow(clippy::significant_drop_tightening)] // Lock scope is intentional
#![allow(clippy::single_match_else)] // Match for clarity
#![allow(clippy::items_after_statements)] // Local imports are fine
#![allow(clippy::unnecessary_debug_formatting)] // Debug format for paths
#![allow(clippy::new_without_default)] // Explicit new() is fine
#![allow(clippy::redundant_closure_for_method_calls)] // Explicit closures
#![allow(clippy::map_unwrap_or)] // map().unwrap_or is clearer
#![allow(clippy::module_name_repetitions)] // TorController in tor:: reads fine

pub mod bridges;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod reachability;
pub mod supervisor;
pub mod tor;
pub mod transport;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{Result, TorError};
pub use supervisor::{TorDelegate, TorState, TorSupervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
