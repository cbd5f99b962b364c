//! Lifecycle events and the bus that fans them out
//!
//! Every payload is an owned snapshot of the document; subscribers never
//! see registry state directly. Events for different documents may
//! interleave freely, so consumers key on the fingerprint.

use crate::document::{Document, Fingerprint};
use crate::monitor::FailureCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Non-fatal conditions reported alongside the lifecycle stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    /// The archival copy source disappeared before it could be copied
    SourceVanished,
    /// A delete notification arrived for a path with no tracked document
    UnmatchedUnlink,
    /// The archive directory refused the copy
    ArchiveFailed,
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarningCode::SourceVanished => f.write_str("SOURCE_VANISHED"),
            WarningCode::UnmatchedUnlink => f.write_str("UNMATCHED_UNLINK"),
            WarningCode::ArchiveFailed => f.write_str("ARCHIVE_FAILED"),
        }
    }
}

/// Resolved document lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A new fingerprint was observed
    ///
    /// `resync` is set for documents rediscovered by the rescan that follows
    /// a connectivity recovery rather than newly arrived.
    Created { document: Document, resync: bool },
    /// Known content reappeared under a different path
    Renamed { document: Document, previous_path: PathBuf },
    /// Content at a path was superseded
    Changed { document: Document, previous: Fingerprint },
    /// An unlink survived the grace period
    Deleted { document: Document },
    /// The document was archived at `destination`
    Copy { document: Document, destination: PathBuf },
    Warning {
        code: WarningCode,
        document: Option<Document>,
        path: Option<PathBuf>,
    },
    Error { code: FailureCode, message: String },
}

impl LifecycleEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Created { .. } => "created",
            LifecycleEvent::Renamed { .. } => "renamed",
            LifecycleEvent::Changed { .. } => "changed",
            LifecycleEvent::Deleted { .. } => "deleted",
            LifecycleEvent::Copy { .. } => "copy",
            LifecycleEvent::Warning { .. } => "warning",
            LifecycleEvent::Error { .. } => "error",
        }
    }

    /// The affected document, if the event carries one
    pub fn document(&self) -> Option<&Document> {
        match self {
            LifecycleEvent::Created { document, .. }
            | LifecycleEvent::Renamed { document, .. }
            | LifecycleEvent::Changed { document, .. }
            | LifecycleEvent::Deleted { document }
            | LifecycleEvent::Copy { document, .. } => Some(document),
            LifecycleEvent::Warning { document, .. } => document.as_ref(),
            LifecycleEvent::Error { .. } => None,
        }
    }
}

/// Publish/subscribe surface consumed by the transport layer
///
/// Backed by a broadcast channel: each subscriber gets every event published
/// after it subscribed, and a subscriber that falls more than the configured
/// capacity behind skips the oldest events.
#[derive(Debug, Clone)]
pub struct LifecycleEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: LifecycleEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!("Published {} to {} subscribers", name, receivers),
            Err(_) => trace!("Dropped {} event, no subscribers", name),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
