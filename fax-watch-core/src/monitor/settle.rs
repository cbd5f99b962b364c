//! Write settling for add/change notifications
//!
//! Scanners write documents over several seconds. A path is held back until
//! it has produced no notification for the settle delay and its size is
//! unchanged since the last look, mirroring an await-write-finish policy.

use crate::monitor::RawNotification;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What a settled path will be reported as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Add { resync: bool },
    Change,
}

#[derive(Debug)]
struct PendingWrite {
    kind: WriteKind,
    last_event: Instant,
    last_len: Option<u64>,
    count: usize,
}

/// Holds add/change notifications until the file stops changing
#[derive(Debug)]
pub struct WriteSettler {
    delay: Duration,
    pending: HashMap<PathBuf, PendingWrite>,
}

impl WriteSettler {
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: HashMap::new() }
    }

    /// Record activity on a path, restarting its quiet period
    ///
    /// An add stays an add however many changes follow it.
    pub fn observe(&mut self, path: PathBuf, kind: WriteKind) {
        self.observe_at(path, kind, Instant::now());
    }

    fn observe_at(&mut self, path: PathBuf, kind: WriteKind, now: Instant) {
        let len = file_len(&path);
        self.pending
            .entry(path)
            .and_modify(|p| {
                if matches!(kind, WriteKind::Add { .. }) {
                    p.kind = kind;
                }
                p.last_event = now;
                p.last_len = len;
                p.count += 1;
            })
            .or_insert(PendingWrite { kind, last_event: now, last_len: len, count: 1 });
    }

    /// Forget a path that has been removed, returning what was pending
    pub fn cancel(&mut self, path: &Path) -> Option<WriteKind> {
        self.pending.remove(path).map(|p| p.kind)
    }

    /// Notifications for every path that has been quiet for the delay
    pub fn take_ready(&mut self) -> Vec<RawNotification> {
        self.take_ready_at(Instant::now())
    }

    fn take_ready_at(&mut self, now: Instant) -> Vec<RawNotification> {
        let delay = self.delay;
        let mut ready = Vec::new();

        self.pending.retain(|path, pending| {
            if now.duration_since(pending.last_event) < delay {
                return true;
            }
            match fs::symlink_metadata(path) {
                Ok(meta) if !meta.is_file() => {
                    trace!("{:?} is not a regular file", path);
                    false
                }
                Ok(meta) if Some(meta.len()) != pending.last_len => {
                    trace!("{:?} still growing ({} bytes)", path, meta.len());
                    pending.last_len = Some(meta.len());
                    pending.last_event = now;
                    true
                }
                Ok(_) => {
                    debug!("{:?} settled after {} notifications", path, pending.count);
                    ready.push(match pending.kind {
                        WriteKind::Add { resync } => RawNotification::Add { path: path.clone(), resync },
                        WriteKind::Change => RawNotification::Change { path: path.clone() },
                    });
                    false
                }
                // Gone before settling; the removal notification covers it.
                Err(_) => false,
            }
        });

        ready
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn file_len(path: &Path) -> Option<u64> {
    fs::symlink_metadata(path).ok().map(|m| m.len())
}
