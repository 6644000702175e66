//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config file locations
const CONFIG_PATHS: &[&str] = &["/etc/torvisor/config.toml", "./config.toml"];

/// Load configuration from an explicit path, or the first default location.
///
/// With no file anywhere the built-in defaults are used.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_from_path(path);
    }

    match find_config_file() {
        Some(path) => load_from_path(&path),
        None => {
            tracing::debug!("No configuration file found, using defaults");
            let config = Config::default();
            super::validate(&config)?;
            Ok(config)
        },
    }
}

/// Find first existing config file
fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Load and parse config from path
pub fn load_from_path(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_str(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse and validate TOML text
pub fn parse_str(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse configuration")?;

    super::validate(&config)?;

    Ok(config)
}
