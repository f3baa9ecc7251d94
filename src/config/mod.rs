//! Configuration module for codap-stacker
//!
//! This module handles:
//! - The TOML configuration file (frame declaration, bridge timeouts,
//!   stacking policy, log filter)
//! - The plugin's persisted interactive state ([`state`])
//!
//! # Config Location
//!
//! The configuration file lives in the platform config directory:
//! - **Linux**: `~/.config/codap-stacker/config.toml`
//! - **macOS**: `~/Library/Application Support/codap-stacker/config.toml`
//! - **Windows**: `%APPDATA%\codap-stacker\config.toml`
//!
//! # Example
//!
//! ```toml
//! [plugin]
//! name = "TidyData"
//! title = "Attribute Stacker"
//!
//! [bridge]
//! request_timeout_ms = 10000
//!
//! [stacking]
//! failure_policy = "rollback"
//! ```

pub mod state;

pub use state::StackerState;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::events::DEFAULT_EVENT_CAPACITY;
use crate::error::{Result, StackerError};
use crate::reshape::FailurePolicy;

/// Application identifier for the config directory
pub const APP_ID: &str = "codap-stacker";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default host reply timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,codap_stacker=debug";

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Plugin window size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            width: 600,
            height: 500,
        }
    }
}

/// What the plugin declares about itself in `update interactiveFrame`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDescriptor {
    pub name: String,
    pub title: String,
    pub version: String,
    pub dimensions: Dimensions,
    pub prevent_bring_to_front: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prevent_data_context_reorg: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cannot_close: Option<bool>,
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self {
            name: "TidyData".to_string(),
            title: "Attribute Stacker".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dimensions: Dimensions::default(),
            prevent_bring_to_front: false,
            prevent_data_context_reorg: None,
            cannot_close: None,
        }
    }
}

/// Wire form of a [`FrameDescriptor`]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameDeclaration<'a> {
    name: &'a str,
    title: &'a str,
    version: &'a str,
    dimensions: Dimensions,
    prevent_bring_to_front: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prevent_data_context_reorg: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cannot_close: Option<bool>,
}

impl FrameDescriptor {
    /// Values of the `update interactiveFrame` request, in the host's camelCase
    pub fn declaration(&self) -> Result<serde_json::Value> {
        let declaration = FrameDeclaration {
            name: &self.name,
            title: &self.title,
            version: &self.version,
            dimensions: self.dimensions,
            prevent_bring_to_front: self.prevent_bring_to_front,
            prevent_data_context_reorg: self.prevent_data_context_reorg,
            cannot_close: self.cannot_close,
        };
        Ok(serde_json::to_value(declaration)?)
    }
}

/// Host channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long to wait for a host reply before treating it as a timeout
    pub request_timeout_ms: u64,
    /// Capacity of the status event queue
    pub event_queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            event_queue_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingConfig {
    /// What to do with the partial data set when a migration halts
    pub failure_policy: FailurePolicy,
    /// Open a case table on the new data set after a complete migration
    pub open_case_table: bool,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            open_case_table: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub plugin: FrameDescriptor,
    pub bridge: BridgeConfig,
    pub stacking: StackingConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StackerError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            StackerError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load from `path` (or the default location), falling back to defaults.
    ///
    /// A missing default file is not worth a warning; anything else is.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Self::default(),
            },
        };

        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StackerError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| StackerError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| StackerError::Config(format!("Failed to write config: {}", e)))
    }
}
