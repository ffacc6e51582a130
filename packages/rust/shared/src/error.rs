//! Error types for papermonitor.
//!
//! Library crates use [`PaperMonitorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only [`PaperMonitorError::Config`] aborts a run. Fetch failures are
//! recorded per source and assessment failures degrade to "unknown"
//! assessments, so those variants normally end up as strings inside
//! `RunStats` / `Assessment` rather than propagating to the caller.

use std::path::PathBuf;

/// Top-level error type for all papermonitor operations.
#[derive(Debug, thiserror::Error)]
pub enum PaperMonitorError {
    /// Missing or invalid configuration. Fatal: the run aborts before fetching.
    #[error("config error: {message}")]
    Config { message: String },

    /// A source could not be queried. Non-fatal: the source contributes zero papers.
    #[error("fetch error from {source_name}: {message}")]
    Fetch {
        source_name: String,
        message: String,
    },

    /// A paper or batch could not be assessed. Non-fatal: degrades to "unknown".
    #[error("assessment error: {0}")]
    Assessment(String),

    /// Network/HTTP error outside of a specific source.
    #[error("network error: {0}")]
    Network(String),

    /// A model reply or upstream payload could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Output writer or notifier failure.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PaperMonitorError>;

impl PaperMonitorError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a fetch error attributed to a source.
    pub fn fetch(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
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

    /// Whether this error must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
