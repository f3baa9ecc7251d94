//! # codap-stacker: attribute stacking plugin
//!
//! A plugin for a host data analysis application that reshapes a "wide" data
//! set into a "long" one. The user arranges attributes of the source data set
//! in a pivot grid; each grid row becomes one value of a new category
//! attribute and each column a new value attribute. Stacking creates a new
//! data set with a child collection holding one case per category value and
//! copies the source rows across one at a time.
//!
//! ## Architecture
//!
//! - **Bridge**: request/response channel to the host with a connection state
//!   machine, statistics and subscriptions for host-initiated notifications
//! - **Reshape**: the pivot layout, its compilation into a stacking plan, the
//!   target schema and the row-by-row migration engine
//! - **Plugin**: the workflow a user interface drives on top of both
//! - **Host**: an in-memory host used by the demo command and the tests
//! - **Communication**: status events go out on a crossbeam channel so a UI
//!   can poll them without blocking
//!
//! ## Configuration
//!
//! Settings are read from `config.toml` in the platform config directory under
//! `codap-stacker`, or from a path given on the command line:
//!
//! - **Linux**: `~/.config/codap-stacker/`
//! - **macOS**: `~/Library/Application Support/codap-stacker/`
//! - **Windows**: `%APPDATA%\codap-stacker\`
//!
//! ## Example
//!
//! ```ignore
//! use codap_stacker::{AppConfig, StackerPlugin, StreamChannel};
//!
//! let config = AppConfig::load_or_default(None);
//! let channel = Arc::new(StreamChannel::stdio(config.bridge.request_timeout()));
//! let (mut plugin, events) = StackerPlugin::new(channel, config);
//!
//! plugin.initialize().await?;
//! plugin.select_source("census").await?;
//! plugin.place("pop2000", CellRef::new(0, 0))?;
//! let report = plugin.submit().await?;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod plugin;
pub mod reshape;
pub mod selector;

// Re-export commonly used types
pub use bridge::{Bridge, CallOutcome, PluginEvent, Request, Response, StreamChannel};
pub use config::AppConfig;
pub use error::{Result, StackerError};
pub use plugin::StackerPlugin;
pub use reshape::{CellRef, FailurePolicy, LayoutSpec, MigrationReport, PivotLayout};
pub use selector::ResourceSelector;
