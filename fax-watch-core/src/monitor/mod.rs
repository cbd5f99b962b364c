//! Directory watching and lifecycle resolution
//!
//! This module turns raw watch-primitive notifications into document
//! lifecycle events:
//! - Extension filtering and failure classification
//! - Write settling, so half-written scans are never fingerprinted
//! - Content-identity resolution of add/change/unlink with a delete grace period
//! - Supervision and recovery when a watched source becomes unreachable

pub mod classifier;
pub mod resolver;
pub mod session;
pub mod settle;
pub mod supervisor;


pub use classifier::{DocumentFilter, FailureCode, WatchFailure};
pub use session::WatchSession;
pub use settle::WriteSettler;
pub use supervisor::{FailureTracker, ResilientWatcher, WatcherHandle, WatcherState};

use std::path::PathBuf;

/// A settled notification from the watch primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotification {
    /// A file appeared; `resync` marks rediscovery after a recovery
    Add { path: PathBuf, resync: bool },
    /// A file's bytes changed in place
    Change { path: PathBuf },
    /// A file disappeared
    Unlink { path: PathBuf },
}

impl RawNotification {
    pub fn path(&self) -> &PathBuf {
        match self {
            RawNotification::Add { path, .. }
            | RawNotification::Change { path }
            | RawNotification::Unlink { path } => path,
        }
    }
}
