//! Path filtering and watch-failure classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;

/// Accepts only files carrying the configured document extension
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    extension: String,
}

impl DocumentFilter {
    pub fn new(extension: &str) -> Self {
        Self { extension: extension.trim_start_matches('.').to_ascii_lowercase() }
    }

    /// Case-insensitive extension match
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

/// Watch-primitive failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ConnectionReset,
    NetworkUnreachable,
    HostUnreachable,
    NotConnected,
    /// A watched directory is missing or was removed
    SourceUnreachable,
    /// The watch primitive stopped delivering notifications
    WatchClosed,
    PermissionDenied,
    WatchLimit,
    Other,
}

impl FailureCode {
    /// Connectivity-class failures trigger a full teardown and resync
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            FailureCode::ConnectionReset
                | FailureCode::NetworkUnreachable
                | FailureCode::HostUnreachable
                | FailureCode::NotConnected
                | FailureCode::SourceUnreachable
                | FailureCode::WatchClosed
        )
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                FailureCode::ConnectionReset
            }
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown => {
                FailureCode::NetworkUnreachable
            }
            io::ErrorKind::HostUnreachable => FailureCode::HostUnreachable,
            io::ErrorKind::NotConnected => FailureCode::NotConnected,
            io::ErrorKind::NotFound => FailureCode::SourceUnreachable,
            io::ErrorKind::PermissionDenied => FailureCode::PermissionDenied,
            _ => FailureCode::Other,
        }
    }

    pub fn from_notify(err: &notify::Error) -> Self {
        match &err.kind {
            notify::ErrorKind::Io(io_err) => Self::from_io(io_err),
            notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
                FailureCode::SourceUnreachable
            }
            notify::ErrorKind::MaxFilesWatch => FailureCode::WatchLimit,
            _ => FailureCode::Other,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCode::ConnectionReset => "ECONNRESET",
            FailureCode::NetworkUnreachable => "ENETUNREACH",
            FailureCode::HostUnreachable => "EHOSTUNREACH",
            FailureCode::NotConnected => "ENOTCONN",
            FailureCode::SourceUnreachable => "SOURCE_UNREACHABLE",
            FailureCode::WatchClosed => "WATCH_CLOSED",
            FailureCode::PermissionDenied => "EACCES",
            FailureCode::WatchLimit => "WATCH_LIMIT",
            FailureCode::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// A classified error reported by a watch session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchFailure {
    pub code: FailureCode,
    pub message: String,
}

impl WatchFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<&notify::Error> for WatchFailure {
    fn from(err: &notify::Error) -> Self {
        Self::new(FailureCode::from_notify(err), err.to_string())
    }
}
