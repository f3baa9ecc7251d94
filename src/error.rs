//! Error handling for codap-stacker
//!
//! This module defines the crate-wide error type and a Result alias used by
//! the bridge, the reshape engine and the plugin flow.

use thiserror::Error;

/// Main error type for codap-stacker operations
#[derive(Error, Debug)]
pub enum StackerError {
    /// A request was submitted on a connection that has been closed
    #[error("Connection closed: request dropped")]
    ConnectionClosed,

    /// `initialize` was called on a bridge that was already initialized
    #[error("Bridge already initialized")]
    AlreadyInitialized,

    /// The transport could not carry a message at all
    #[error("Channel error: {0}")]
    Channel(String),

    /// The host sent something that does not fit the message protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The host answered a request with `success: false`
    #[error("Host rejected {resource}: {message}")]
    HostFailure { resource: String, message: String },

    /// The host never answered within the channel's timeout window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Errors related to the pivot layout grid
    #[error("Layout error: {0}")]
    Layout(String),

    /// Errors related to data set schemas
    #[error("Schema error: {0}")]
    Schema(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// A notification subscription pattern failed to compile
    #[error("Invalid subscription pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<StackerError>,
    },
}

impl StackerError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        StackerError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a host failure for a resource, using the host's error text when present
    pub fn host_failure(resource: impl Into<String>, message: Option<&str>) -> Self {
        StackerError::HostFailure {
            resource: resource.into(),
            message: message.unwrap_or("request was not successful").to_string(),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &StackerError {
        match self {
            StackerError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for codap-stacker operations
pub type Result<T> = std::result::Result<T, StackerError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
