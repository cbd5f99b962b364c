//! Core functionality for fax-watch
//!
//! Monitors the directories that networked fax machines and scanners drop
//! documents into, tracks each document by content fingerprint and publishes
//! lifecycle events (created, renamed, changed, deleted, copy) to
//! subscribers. The watch recovers automatically when a network share
//! disappears and comes back.

pub mod archive;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod feed;
pub mod identity;
pub mod monitor;
pub mod registry;

pub use archive::ArchivalCopier;
pub use config::{WatchedSource, WatcherConfig};
pub use document::{Document, Fingerprint};
pub use error::{Result, WatchError};
pub use events::{LifecycleEvent, LifecycleEventBus, WarningCode};
pub use feed::FeedServer;
pub use identity::ContentIdentifier;
pub use monitor::{FailureCode, ResilientWatcher, WatcherHandle, WatcherState};
pub use registry::{DocumentRegistry, SharedRegistry, UnlinkMark};
