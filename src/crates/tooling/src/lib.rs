//! Shared plumbing for the pflow crates
//!
//! - [`config`]: layered settings read from defaults, files and `PF_*` variables
//! - [`logging`]: duration formatting and secret redaction for log lines
//! - [`async_utils`]: deadlines around futures

pub mod async_utils;
pub mod config;
pub mod logging;

use thiserror::Error;

/// Errors raised while loading settings or formatting diagnostics
#[derive(Debug, Error)]
pub enum ToolingError {
    #[error("{0}")]
    General(String),

    /// A variable is set but its value cannot be used
    #[error("environment variable {key} has an invalid value: {reason}")]
    InvalidEnv { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ToolingError>;
