//! Error types for the redo pipeline.
//!
//! Every error carries a numeric code and a category; the category decides
//! whether the pipeline dies or degrades (network errors inside the writer
//! flip it back to the accept loop, data errors may be downgraded to
//! warnings with `ignore-data-errors`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for classification and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid settings; fatal at startup
    Configuration,
    /// Sink/consumer connectivity; non-fatal inside the writer
    Network,
    /// Malformed schema, checkpoint or metadata content
    Data,
    /// Malformed redo log content (bad block, CRC, sequence)
    Redo,
    /// Internal failure (quota deadlock, swap I/O, unsupported version)
    Runtime,
}

/// Pipeline errors with a stable numeric code per failure site.
#[derive(Error, Debug)]
pub enum RedoError {
    #[error("configuration error [{code}]: {message}")]
    Config { code: u32, message: String },

    #[error("network error [{code}]: {message}")]
    Network { code: u32, message: String },

    #[error("data error [{code}]: {message}")]
    Data { code: u32, message: String },

    #[error("redo log error [{code}]: {message}")]
    Redo { code: u32, message: String },

    #[error("runtime error [{code}]: {message}")]
    Runtime { code: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RedoError {
    pub fn config(code: u32, message: impl Into<String>) -> Self {
        Self::Config { code, message: message.into() }
    }

    pub fn network(code: u32, message: impl Into<String>) -> Self {
        Self::Network { code, message: message.into() }
    }

    pub fn data(code: u32, message: impl Into<String>) -> Self {
        Self::Data { code, message: message.into() }
    }

    pub fn redo(code: u32, message: impl Into<String>) -> Self {
        Self::Redo { code, message: message.into() }
    }

    pub fn runtime(code: u32, message: impl Into<String>) -> Self {
        Self::Runtime { code, message: message.into() }
    }

    /// Numeric error code; IO and JSON errors map onto fixed runtime codes.
    pub fn code(&self) -> u32 {
        match self {
            Self::Config { code, .. }
            | Self::Network { code, .. }
            | Self::Data { code, .. }
            | Self::Redo { code, .. }
            | Self::Runtime { code, .. } => *code,
            Self::Io(_) => 50001,
            Self::Json(_) => 30001,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::Network { .. } => ErrorCategory::Network,
            Self::Data { .. } | Self::Json(_) => ErrorCategory::Data,
            Self::Redo { .. } => ErrorCategory::Redo,
            Self::Runtime { .. } | Self::Io(_) => ErrorCategory::Runtime,
        }
    }

    /// Whether the process must stop. Data and redo errors may be downgraded
    /// by the caller when `ignore-data-errors` is set; this reports the
    /// default disposition.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Network)
    }

    /// Whether `ignore-data-errors` may downgrade this error to a warning.
    pub fn is_ignorable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Data | ErrorCategory::Redo)
    }
}

pub type Result<T> = std::result::Result<T, RedoError>;
