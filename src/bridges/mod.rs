//! Bridge selection
//!
//! Which bridges the daemon should use, and whether the daemon's current
//! configuration is out of date with respect to that choice.

pub mod catalog;

pub use catalog::{bridges_as_args, bridges_as_conf, BridgeCatalog};

use serde::Deserialize;

/// Transport mode selected by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Direct connection, no bridges
    #[default]
    None,
    /// Built-in obfs4 bridges
    Obfs4,
    /// Built-in snowflake bridge
    Snowflake,
    /// Host-supplied bridge lines, assumed obfs4-compatible
    Custom,
}

impl BridgeMode {
    pub fn uses_bridges(self) -> bool {
        self != BridgeMode::None
    }
}

/// Current bridge selection plus the pending-reconfiguration flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSettings {
    mode: BridgeMode,
    custom: Option<Vec<String>>,
    needs_reconfiguration: bool,
}

impl BridgeSettings {
    pub fn new(mode: BridgeMode, custom: Option<Vec<String>>) -> Self {
        Self {
            mode,
            custom,
            needs_reconfiguration: false,
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn custom(&self) -> Option<&[String]> {
        self.custom.as_deref()
    }

    pub fn needs_reconfiguration(&self) -> bool {
        self.needs_reconfiguration
    }

    /// Store a new selection and record whether it differs from the old one.
    ///
    /// The flag is overwritten, not accumulated. An absent custom list and an
    /// empty one are different selections.
    pub fn set(&mut self, mode: BridgeMode, custom: Option<Vec<String>>) {
        let changed = if mode != self.mode {
            true
        } else {
            match (&self.custom, &custom) {
                (Some(old), Some(new)) => old != new,
                (None, None) => false,
                _ => true,
            }
        };

        self.needs_reconfiguration = changed;
        self.mode = mode;
        self.custom = custom;
    }

    /// Force the next start to push bridge configuration to the daemon
    pub fn force_reconfiguration(&mut self) {
        self.needs_reconfiguration = true;
    }

    /// Consume the flag after the configuration reached the daemon
    pub fn clear_reconfiguration(&mut self) {
        self.needs_reconfiguration = false;
    }
}
