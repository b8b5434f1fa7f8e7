//! Optional configuration for vcsnoop.
//!
//! Read from `~/.vcsnoop/config.toml`. Without the file every setting keeps
//! its default and the tool needs nothing but the console path.
//!
//! ```toml
//! # End-of-paste quiet period in milliseconds, 1 to 65535
//! quiescence_ms = 1000
//!
//! [log]
//! # tracing filter directive; logging is off when unset
//! level = "debug"
//! # log destination; standard error when unset
//! file = "/tmp/vcsnoop.log"
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::core::relay::{DEFAULT_QUIESCENCE, MAX_QUIESCENCE};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Quiet period that ends the paste capture
    pub quiescence_ms: u64,
    /// Logging settings
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quiescence_ms: DEFAULT_QUIESCENCE.as_millis() as u64,
            log: LogConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// A missing file is not an error.
    pub fn load() -> anyhow::Result<Self> {
        match Self::get_config_path() {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Quiet period, clamped to what the relay can wait for
    pub fn quiescence(&self) -> Duration {
        let max = MAX_QUIESCENCE.as_millis() as u64;
        Duration::from_millis(self.quiescence_ms.clamp(1, max))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".vcsnoop").join("config.toml"))
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}
