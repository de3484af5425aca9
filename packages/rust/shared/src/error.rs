//! Error types for Waymark.
//!
//! Library crates use [`WaymarkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Waymark operations.
#[derive(Debug, thiserror::Error)]
pub enum WaymarkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an upstream provider.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream provider returned an unusable response (bad status,
    /// missing fields, unparseable payload).
    #[error("provider error: {0}")]
    Provider(String),

    /// Synthesis output could not be parsed into candidate steps.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown enum value, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Referenced corridor does not exist. Terminal for a pipeline run.
    #[error("corridor not found: {0}")]
    CorridorNotFound(String),

    /// Research failed and the corridor has no stored content to
    /// synthesize from. Terminal for a pipeline run.
    #[error("no content available to synthesize from for corridor {0}")]
    NoContent(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WaymarkError>;

impl WaymarkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts a pipeline run outright. Everything else
    /// degrades to partial results.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CorridorNotFound(_) | Self::NoContent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = WaymarkError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = WaymarkError::validation("unknown status value");
        assert!(err.to_string().contains("unknown status"));
    }

    #[test]
    fn terminal_classification() {
        assert!(WaymarkError::CorridorNotFound("x".into()).is_terminal());
        assert!(WaymarkError::NoContent("x".into()).is_terminal());
        assert!(!WaymarkError::Network("timeout".into()).is_terminal());
        assert!(!WaymarkError::Provider("502".into()).is_terminal());
    }
}
