//! Configuration for docpane.
//!
//! Policy constants are exposed here rather than hard-coded: navigation
//! history bound, long-poll timeout, update-backlog retention, autosave
//! delay. Values can be overridden from a TOML file:
//!
//! ```toml
//! [history]
//! limit = 50
//!
//! [protocol]
//! pull_timeout_ms = 30000
//! update_retention = 500
//!
//! [save]
//! autosave_delay_ms = 1000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Navigation history settings
    pub history: HistoryConfig,
    /// Update-protocol settings
    pub protocol: ProtocolConfig,
    /// Save behavior settings
    pub save: SaveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            protocol: ProtocolConfig::default(),
            save: SaveConfig::default(),
        }
    }
}

/// Per-leaf back/forward navigation history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of retained history entries per leaf
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { limit: 50 }
    }
}

/// Incremental-update protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a pull with no newer version parks before returning empty
    pub pull_timeout_ms: u64,
    /// Number of applied updates retained per document for replay
    pub update_retention: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            pull_timeout_ms: 30_000,
            update_retention: 500,
        }
    }
}

/// Save behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Delay between an edit and the autosave it schedules. 0 disables
    /// autosave.
    pub autosave_delay_ms: u64,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            autosave_delay_ms: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file is missing or unparsable.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(_) => {
                        tracing::warn!(path = %path.display(), "ignoring unparsable config file");
                    }
                }
            }
        }
        Self::default()
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.pull_timeout_ms)
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.save.autosave_delay_ms)
    }
}
