//! Error types for the watcher core
//!
//! Every failure the core can observe is transient from the process's point
//! of view. These variants are logged or surfaced as `warning`/`error`
//! lifecycle events; none of them terminates the watcher.

use crate::monitor::FailureCode;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, WatchError>;

/// Main error type for watcher operations
#[derive(Debug, Error)]
pub enum WatchError {
    /// Content could not be fingerprinted, usually because the file vanished mid-read
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archival copy source disappeared before the copy completed
    #[error("Source {path:?} vanished before it could be archived: {source}")]
    SourceVanished {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archival copy could not be written
    #[error("Failed to archive to {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Delete notification for a path with no tracked document
    #[error("Unlink for untracked path {path:?}")]
    UnmatchedUnlink { path: PathBuf },

    /// The watch primitive lost contact with a source
    #[error("Connectivity failure: {code}")]
    Connectivity { code: FailureCode },

    /// Invalid or unreachable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Error raised by the underlying watch primitive
    #[error("Watch primitive error: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}
