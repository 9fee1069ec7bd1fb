//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
///
/// A missing or expired key is not an error; lookups return `Option`.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, rejected at construction time
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Operation attempted after `close()`
    #[error("Cache is closed")]
    Closed,

    /// Background work requested outside a tokio runtime
    #[error("No tokio runtime available to run {0}")]
    NoRuntime(&'static str),

    /// A pluggable tier failed
    #[error("Backend '{tier}' failed: {reason}")]
    Backend { tier: String, reason: String },

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file: {0}")]
    ConfigFile(#[from] serde_yaml::Error),

    /// Prometheus registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a backend error for the named tier
    pub fn backend(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Backend {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }
}
