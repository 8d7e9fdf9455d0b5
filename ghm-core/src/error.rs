//! Startup configuration errors
//!
//! Only configuration problems are allowed to stop the process, and only
//! before the first poll. Everything that can go wrong at runtime has its own
//! error type next to the component that raises it.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration error detected during startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required file could not be read
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A row of the error mapping table could not be parsed
    #[error("{path:?} line {line}: {reason}")]
    MalformedTable {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The same error code appears twice in the error mapping table
    #[error("{path:?} line {line}: duplicate error code {code:?} (first defined on line {first_line})")]
    DuplicateCode {
        path: PathBuf,
        line: usize,
        first_line: usize,
        code: String,
    },

    /// The error mapping table has no rows
    #[error("Error mapping table {0:?} contains no entries")]
    EmptyTable(PathBuf),

    /// A setting is missing or has an invalid value
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// No constructor is registered for an event processor type
    #[error("Unknown event processor type: {0}")]
    UnknownProcessor(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
