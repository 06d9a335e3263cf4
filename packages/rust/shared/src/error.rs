//! Error types for boxoffice.
//!
//! Library crates use [`BoxOfficeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-entity API failures are not errors: they are classified outcomes
//! (see `boxoffice-metadata`). Only failures that abort a whole operation
//! surface here.

use std::path::PathBuf;

/// Top-level error type for all boxoffice operations.
#[derive(Debug, thiserror::Error)]
pub enum BoxOfficeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// HTTP client construction or other non-classifiable network failure.
    #[error("network error: {0}")]
    Network(String),

    /// A statement or transaction against the store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The store could not be reached after all connection attempts.
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    StoreUnavailable { attempts: u32, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad identifier, unparseable stored value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BoxOfficeError>;

impl BoxOfficeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap any displayable store error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
